//! Tunnel selection across the primary set.
//!
//! A pick comes from the configured [`SelectionStrategy`] among `CONNECTED`
//! primaries whose last sample is not unhealthy. With none available the
//! balancer falls back to the least unhealthy serving primary, and only
//! fails when nothing serves at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Instant, SystemTime};

use tokio::sync::Mutex;
use tracing::{debug, info};

use tunnelkeeper_core::config::{BalancerSettings, BalancingStrategy};

use crate::pool::TunnelPool;
use crate::tracker::{HealthSample, StateTracker};
use crate::tunnel::{TunnelConnection, TunnelId, TunnelManager, TunnelState};

/// Re-reads of a stale pick before giving up.
const MAX_STALE_RETRIES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("Load balancer is disabled")]
    Disabled,

    #[error("No tunnel available")]
    NoTunnelAvailable,

    #[error("Requested {requested} active tunnels, allowed {min}..={max}")]
    OutOfBounds {
        requested: usize,
        min: usize,
        max: usize,
    },
}

/// A selectable tunnel with the data strategies rank on.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub connection: TunnelConnection,
    pub last_sample: Option<HealthSample>,
    pub last_healthy_at: Option<SystemTime>,
    pub last_used: Option<Instant>,
}

impl Candidate {
    pub const fn id(&self) -> TunnelId {
        self.connection.id
    }
}

/// Picks one candidate. Receives a non-empty slice sorted by id.
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, candidates: &[Candidate]) -> Option<usize>;
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }
}

/// Never-used tunnels first, then the one idle the longest.
#[derive(Debug, Default)]
pub struct LeastRecentlyUsed;

impl SelectionStrategy for LeastRecentlyUsed {
    fn name(&self) -> &'static str {
        "least-recently-used"
    }

    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.last_used)
            .map(|(i, _)| i)
    }
}

/// Lowest `latency_ms + 1000 * packet_loss` wins; unmeasured tunnels rank
/// last. Ties go to the lower id.
#[derive(Debug, Default)]
pub struct HealthBased;

impl HealthBased {
    pub fn score(sample: Option<&HealthSample>) -> f64 {
        match sample {
            Some(HealthSample {
                latency: Some(latency),
                packet_loss,
                ..
            }) => latency.as_secs_f64().mul_add(1_000.0, 1_000.0 * packet_loss),
            _ => f64::MAX,
        }
    }
}

impl SelectionStrategy for HealthBased {
    fn name(&self) -> &'static str {
        "health-based"
    }

    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                Self::score(a.last_sample.as_ref()).total_cmp(&Self::score(b.last_sample.as_ref()))
            })
            .map(|(i, _)| i)
    }
}

pub fn strategy_for(kind: BalancingStrategy) -> Box<dyn SelectionStrategy> {
    match kind {
        BalancingStrategy::RoundRobin => Box::new(RoundRobin::default()),
        BalancingStrategy::LeastRecentlyUsed => Box::new(LeastRecentlyUsed),
        BalancingStrategy::HealthBased => Box::new(HealthBased),
    }
}
/// A selection and the candidate class it came from.
#[derive(Debug)]
struct Pick {
    connection: TunnelConnection,
    from_healthy: bool,
}

impl Pick {
    const fn healthy(connection: TunnelConnection) -> Self {
        Self {
            connection,
            from_healthy: true,
        }
    }

    /// Whether the re-read tunnel may still be served. A pick made among
    /// healthy candidates is only kept while the tunnel stays `CONNECTED`.
    fn still_valid(&self, current: &TunnelConnection) -> bool {
        if current.is_quarantined() || !current.state.is_serving() {
            return false;
        }
        !self.from_healthy || current.state == TunnelState::Connected
    }
}

pub struct LoadBalancer {
    manager: Arc<TunnelManager>,
    tracker: Arc<StateTracker>,
    pool: Arc<TunnelPool>,
    strategy: Box<dyn SelectionStrategy>,
    min_active: usize,
    max_active: usize,
    enabled: AtomicBool,
    preferred: Mutex<Option<TunnelId>>,
    last_used: Mutex<HashMap<TunnelId, Instant>>,
    selections: Mutex<HashMap<TunnelId, u64>>,
}

impl LoadBalancer {
    pub fn new(
        manager: Arc<TunnelManager>,
        pool: Arc<TunnelPool>,
        settings: &BalancerSettings,
    ) -> Self {
        let min_active = settings.min_active_tunnels.max(1);
        Self {
            tracker: Arc::clone(manager.tracker()),
            manager,
            pool,
            strategy: strategy_for(settings.strategy),
            min_active,
            max_active: settings.max_active_tunnels.max(min_active),
            enabled: AtomicBool::new(false),
            preferred: Mutex::new(None),
            last_used: Mutex::new(HashMap::new()),
            selections: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Box<dyn SelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!(strategy = self.strategy.name(), "Load balancer enabled");
        }
    }

    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            info!("Load balancer disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub const fn bounds(&self) -> (usize, usize) {
        (self.min_active, self.max_active)
    }

    /// Prefer `id` whenever it is selectable.
    pub async fn prefer(&self, id: TunnelId) {
        *self.preferred.lock().await = Some(id);
    }

    pub async fn preferred(&self) -> Option<TunnelId> {
        *self.preferred.lock().await
    }

    /// Pick the tunnel for the next logical request.
    pub async fn select_tunnel(&self) -> Result<TunnelConnection, BalancerError> {
        if !self.is_enabled() {
            return Err(BalancerError::Disabled);
        }

        for _ in 0..MAX_STALE_RETRIES {
            let Some(picked) = self.pick().await else {
                return Err(BalancerError::NoTunnelAvailable);
            };

            // The pool snapshot may have moved on since the pick.
            match self.manager.get(picked.connection.id).await {
                Some(current) if picked.still_valid(&current) => {
                    self.mark_used(current.id).await;
                    return Ok(current);
                }
                _ => debug!(tunnel_id = %picked.connection.id, "Stale pick, reselecting"),
            }
        }
        Err(BalancerError::NoTunnelAvailable)
    }

    async fn pick(&self) -> Option<Pick> {
        let (healthy, fallback) = self.candidates().await;

        if let Some(preferred) = *self.preferred.lock().await
            && let Some(candidate) = healthy.iter().find(|c| c.id() == preferred)
        {
            return Some(Pick::healthy(candidate.connection.clone()));
        }

        if !healthy.is_empty() {
            let index = self.strategy.select(&healthy)?;
            return healthy
                .get(index)
                .map(|c| Pick::healthy(c.connection.clone()));
        }

        // Degraded mode: most recent healthy sample wins, then lower loss.
        let best = fallback.into_iter().max_by(|a, b| {
            a.last_healthy_at.cmp(&b.last_healthy_at).then_with(|| {
                let a_loss = a.last_sample.as_ref().map_or(1.0, |s| s.packet_loss);
                let b_loss = b.last_sample.as_ref().map_or(1.0, |s| s.packet_loss);
                b_loss.total_cmp(&a_loss)
            })
        })?;
        info!(tunnel_id = %best.id(), "No healthy tunnel, serving from degraded tunnel");
        Some(Pick {
            connection: best.connection,
            from_healthy: false,
        })
    }

    /// Serving primaries split into healthy and degraded-mode candidates.
    async fn candidates(&self) -> (Vec<Candidate>, Vec<Candidate>) {
        let mut healthy = Vec::new();
        let mut fallback = Vec::new();
        let last_used = self.last_used.lock().await.clone();

        let mut primaries = self.pool.primaries().await;
        primaries.sort();
        for id in primaries {
            let Some(connection) = self.manager.get(id).await else {
                continue;
            };
            if connection.is_quarantined() || !connection.state.is_serving() {
                continue;
            }
            let candidate = Candidate {
                connection,
                last_sample: self.tracker.last_sample(id).await,
                last_healthy_at: self.tracker.last_healthy_sample(id).await.map(|s| s.at),
                last_used: last_used.get(&id).copied(),
            };

            let sample_ok = candidate.last_sample.as_ref().is_none_or(|s| s.healthy);
            if candidate.connection.state == TunnelState::Connected && sample_ok {
                healthy.push(candidate);
            } else {
                fallback.push(candidate);
            }
        }
        (healthy, fallback)
    }

    async fn mark_used(&self, id: TunnelId) {
        self.last_used.lock().await.insert(id, Instant::now());
        *self.selections.lock().await.entry(id).or_insert(0) += 1;
    }

    /// Selections served per tunnel.
    pub async fn selection_counts(&self) -> HashMap<TunnelId, u64> {
        self.selections.lock().await.clone()
    }

    /// Check a requested number of active tunnels against the bounds.
    pub const fn check_scale(&self, requested: usize) -> Result<(), BalancerError> {
        if requested < self.min_active || requested > self.max_active {
            return Err(BalancerError::OutOfBounds {
                requested,
                min: self.min_active,
                max: self.max_active,
            });
        }
        Ok(())
    }
}
