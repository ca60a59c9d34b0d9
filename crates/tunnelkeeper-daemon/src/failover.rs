//! Promotion of backup tunnels when a primary fails for good.
//!
//! The failover manager is the only writer of the [`TunnelPool`]. A primary
//! that reaches `FAILED` (its reconnect budget is spent) or is closed by a
//! quarantine starts a failure episode; the healthiest backup that has
//! passed at least one health probe is promoted and preferred by the load
//! balancer. Each episode gets at most `max_failover_attempts` tries.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnelkeeper_core::TunnelRole;
use tunnelkeeper_core::config::FailoverSettings;

use crate::balancer::{HealthBased, LoadBalancer};
use crate::events::{EventBus, TunnelEvent, next_event};
use crate::health::HealthMonitor;
use crate::pool::TunnelPool;
use crate::tracker::{HealthSample, StateTracker};
use crate::tunnel::{TunnelError, TunnelId, TunnelManager, TunnelState};

/// Failover records kept for inspection.
const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Tunnel {id} is already in the pool")]
    AlreadyRegistered { id: TunnelId },

    #[error("Tunnel {id} is not a primary")]
    NotPrimary { id: TunnelId },

    #[error("No eligible backup to replace tunnel {id}")]
    NoEligibleBackup { id: TunnelId },

    #[error("Failover attempts for tunnel {id} exhausted after {attempts}")]
    AttemptsExhausted { id: TunnelId, attempts: u32 },

    #[error("Cannot demote the last primary {id}")]
    LastPrimary { id: TunnelId },
}

/// Attempts made for one down primary.
#[derive(Debug, Default, Clone, Copy)]
struct Episode {
    attempts: u32,
    /// Set once `max_failover_attempts` is hit; reconcile leaves it alone.
    exhausted: bool,
}

/// One failure episode of a primary tunnel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverEvent {
    pub failed_tunnel: TunnelId,
    pub reason: String,
    /// 1-based attempt within the episode.
    pub attempt: u32,
    pub at: SystemTime,
}

/// The backup chosen for promotion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverSelection {
    pub promoted_tunnel: TunnelId,
    pub score: f64,
    pub latency: Option<Duration>,
    /// Whether the backup was already established before the failure.
    pub pre_established: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverRecord {
    pub event: FailoverEvent,
    /// `None` when the attempt found no eligible backup.
    pub selection: Option<FailoverSelection>,
}

pub struct FailoverManager {
    manager: Arc<TunnelManager>,
    tracker: Arc<StateTracker>,
    pool: Arc<TunnelPool>,
    balancer: Arc<LoadBalancer>,
    health: Arc<HealthMonitor>,
    settings: FailoverSettings,
    reconcile_interval: Duration,
    enabled: AtomicBool,
    events: EventBus,
    episodes: Mutex<HashMap<TunnelId, Episode>>,
    history: Mutex<VecDeque<FailoverRecord>>,
    failovers: AtomicU64,
    /// Serializes pool mutations.
    mutation: Mutex<()>,
    listener: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl FailoverManager {
    pub fn new(
        manager: Arc<TunnelManager>,
        pool: Arc<TunnelPool>,
        balancer: Arc<LoadBalancer>,
        health: Arc<HealthMonitor>,
        settings: FailoverSettings,
    ) -> Self {
        Self {
            tracker: Arc::clone(manager.tracker()),
            reconcile_interval: health.check_interval(),
            manager,
            pool,
            balancer,
            health,
            settings,
            enabled: AtomicBool::new(false),
            events: EventBus::default(),
            episodes: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            failovers: AtomicU64::new(0),
            mutation: Mutex::new(()),
            listener: Mutex::new(None),
        }
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub const fn pool(&self) -> &Arc<TunnelPool> {
        &self.pool
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn add_primary_tunnel(&self, id: TunnelId) -> Result<(), FailoverError> {
        self.add(id, TunnelRole::Primary).await
    }

    /// Register a backup. With proactive backups enabled it is established
    /// right away.
    pub async fn add_backup_tunnel(&self, id: TunnelId) -> Result<(), FailoverError> {
        self.add(id, TunnelRole::Backup).await?;
        if self.is_enabled() && self.settings.enable_proactive_backups {
            self.prepare_backup(id).await;
        }
        Ok(())
    }

    async fn add(&self, id: TunnelId, role: TunnelRole) -> Result<(), FailoverError> {
        if self.manager.state(id).await.is_none() {
            return Err(TunnelError::NotFound { id }.into());
        }
        let _guard = self.mutation.lock().await;
        if !self.pool.insert(id, role).await {
            return Err(FailoverError::AlreadyRegistered { id });
        }
        info!(tunnel_id = %id, ?role, "Tunnel added to pool");
        Ok(())
    }

    /// Start reacting to primary failures.
    pub async fn enable(self: &Arc<Self>, parent: &CancellationToken) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.settings.enable_proactive_backups {
            self.prepare_backups().await;
        }

        let token = parent.child_token();
        let mut rx = self.manager.events().subscribe();
        let this = Arc::clone(self);
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        this.reconcile().await;
                    }
                    event = next_event(&mut rx) => {
                        let Some(event) = event else { break };
                        match event {
                            TunnelEvent::TunnelError {
                                tunnel_id,
                                state: TunnelState::Failed,
                                error,
                            } => this.on_failure(tunnel_id, &error).await,
                            TunnelEvent::TunnelDisconnected {
                                tunnel_id,
                                to: TunnelState::Closed,
                                reason,
                                ..
                            } => {
                                if this.manager.is_quarantined(tunnel_id).await {
                                    this.on_failure(tunnel_id, &reason).await;
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
            debug!("Failover listener exited");
        });
        *self.listener.lock().await = Some((token, handle));

        info!(
            max_attempts = self.settings.max_failover_attempts,
            proactive_backups = self.settings.enable_proactive_backups,
            "Failover enabled"
        );
    }

    pub async fn disable(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some((token, handle)) = self.listener.lock().await.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Failover listener panicked");
            }
        }
        info!("Failover disabled");
    }

    async fn on_failure(&self, id: TunnelId, reason: &str) {
        match self.handle_primary_failure(id, reason).await {
            Ok(_) | Err(FailoverError::NotPrimary { .. }) => {}
            Err(e) => warn!(tunnel_id = %id, error = %e, "Failover did not complete"),
        }
    }

    /// Establish every backup still `PENDING`.
    pub async fn prepare_backups(&self) {
        for id in self.pool.backups().await {
            self.prepare_backup(id).await;
        }
    }

    async fn prepare_backup(&self, id: TunnelId) {
        if self.manager.state(id).await != Some(TunnelState::Pending) {
            return;
        }
        match self.manager.establish_tunnel(id).await {
            Ok(()) => info!(tunnel_id = %id, "Backup tunnel pre-established"),
            Err(e) => warn!(tunnel_id = %id, error = %e, "Backup tunnel failed to establish"),
        }
    }

    /// Retry failover for every primary that is down but still pooled,
    /// including primaries that failed before failover was enabled.
    /// Primaries whose episode is exhausted are skipped until they leave
    /// the down state. Returns how many primaries were retried.
    pub async fn reconcile(&self) -> usize {
        let mut retried = 0;
        for id in self.pool.primaries().await {
            let Some(connection) = self.manager.get(id).await else {
                continue;
            };
            let down = connection.state == TunnelState::Failed
                || (connection.state == TunnelState::Closed && connection.is_quarantined());
            if !down {
                self.episodes.lock().await.remove(&id);
                continue;
            }
            if self.is_exhausted(id).await {
                continue;
            }
            let reason = connection
                .last_error
                .or(connection.quarantine)
                .unwrap_or_else(|| "tunnel down".to_string());
            self.on_failure(id, &reason).await;
            retried += 1;
        }
        retried
    }

    /// Whether failover gave up on `id` for its current failure.
    pub async fn is_exhausted(&self, id: TunnelId) -> bool {
        self.episodes
            .lock()
            .await
            .get(&id)
            .is_some_and(|e| e.exhausted)
    }

    /// Replace a failed primary with the healthiest eligible backup.
    pub async fn handle_primary_failure(
        &self,
        id: TunnelId,
        reason: &str,
    ) -> Result<FailoverSelection, FailoverError> {
        let _guard = self.mutation.lock().await;
        if self.pool.role(id).await != Some(TunnelRole::Primary) {
            return Err(FailoverError::NotPrimary { id });
        }

        let attempt = {
            let mut episodes = self.episodes.lock().await;
            let episode = episodes.entry(id).or_default();
            if episode.attempts >= self.settings.max_failover_attempts {
                episode.exhausted = true;
                return Err(FailoverError::AttemptsExhausted {
                    id,
                    attempts: episode.attempts,
                });
            }
            episode.attempts += 1;
            episode.attempts
        };
        let event = FailoverEvent {
            failed_tunnel: id,
            reason: reason.to_string(),
            attempt,
            at: SystemTime::now(),
        };
        warn!(tunnel_id = %id, attempt, reason, "Primary tunnel failed, attempting failover");

        let Some(selection) = self.best_backup().await else {
            error!(tunnel_id = %id, attempt, "Failover failed: no eligible backup");
            self.remember(FailoverRecord {
                event: event.clone(),
                selection: None,
            })
            .await;
            self.events.publish(TunnelEvent::FailoverFailed { failover: event });
            return Err(FailoverError::NoEligibleBackup { id });
        };

        let promoted = selection.promoted_tunnel;
        self.pool.promote(promoted).await;
        self.pool.remove(id).await;
        self.balancer.prefer(promoted).await;
        self.episodes.lock().await.remove(&id);
        self.failovers.fetch_add(1, Ordering::SeqCst);

        info!(
            failed_tunnel = %id,
            promoted_tunnel = %promoted,
            score = selection.score,
            pre_established = selection.pre_established,
            "Failover successful"
        );
        self.remember(FailoverRecord {
            event: event.clone(),
            selection: Some(selection.clone()),
        })
        .await;
        self.events.publish(TunnelEvent::FailoverSuccessful {
            failover: event,
            selection: selection.clone(),
        });
        Ok(selection)
    }

    /// Healthiest backup with at least one passed probe. Backups that are
    /// not yet established are brought up and probed first.
    async fn best_backup(&self) -> Option<FailoverSelection> {
        let mut backups = self.pool.backups().await;
        backups.sort();

        let mut best: Option<(FailoverSelection, HealthSample)> = None;
        for id in backups {
            let Some(connection) = self.manager.get(id).await else {
                continue;
            };
            if connection.is_quarantined() {
                continue;
            }

            let pre_established = connection.state.is_serving();
            if connection.state == TunnelState::Pending {
                if let Err(e) = self.manager.establish_tunnel(id).await {
                    debug!(tunnel_id = %id, error = %e, "Backup could not be established");
                    continue;
                }
                self.health.probe_now(id).await;
            } else if !pre_established {
                continue;
            }

            if self.tracker.healthy_sample_count(id).await == 0 {
                self.health.probe_now(id).await;
            }
            if self.manager.state(id).await != Some(TunnelState::Connected)
                || self.tracker.healthy_sample_count(id).await == 0
            {
                continue;
            }
            let Some(sample) = self.tracker.last_sample(id).await.filter(|s| s.healthy) else {
                continue;
            };

            let score = HealthBased::score(Some(&sample));
            if best.as_ref().is_none_or(|(b, _)| score < b.score) {
                best = Some((
                    FailoverSelection {
                        promoted_tunnel: id,
                        score,
                        latency: sample.latency,
                        pre_established,
                    },
                    sample,
                ));
            }
        }
        best.map(|(selection, _)| selection)
    }

    /// Promote the best backup without a failure, for scaling up.
    pub async fn promote_backup(&self) -> Option<FailoverSelection> {
        let _guard = self.mutation.lock().await;
        let selection = self.best_backup().await?;
        self.pool.promote(selection.promoted_tunnel).await;
        info!(tunnel_id = %selection.promoted_tunnel, "Backup promoted");
        Some(selection)
    }

    /// Drop a tunnel from the pool for good, ending any failure episode.
    pub async fn retire(&self, id: TunnelId) -> Option<TunnelRole> {
        let _guard = self.mutation.lock().await;
        self.episodes.lock().await.remove(&id);
        let role = self.pool.remove(id).await;
        if let Some(role) = role {
            info!(tunnel_id = %id, ?role, "Tunnel retired from pool");
        }
        role
    }

    /// Move a primary back to the backup set, for scaling down.
    pub async fn demote_primary(&self, id: TunnelId) -> Result<(), FailoverError> {
        let _guard = self.mutation.lock().await;
        let primaries = self.pool.primaries().await;
        if !primaries.contains(&id) {
            return Err(FailoverError::NotPrimary { id });
        }
        if primaries.len() <= 1 {
            return Err(FailoverError::LastPrimary { id });
        }
        self.pool.demote(id).await;
        info!(tunnel_id = %id, "Primary demoted");
        Ok(())
    }

    async fn remember(&self, record: FailoverRecord) {
        let mut history = self.history.lock().await;
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(record);
    }

    pub fn failover_count(&self) -> u64 {
        self.failovers.load(Ordering::SeqCst)
    }

    /// Failover attempts, oldest first.
    pub async fn failover_history(&self) -> Vec<FailoverRecord> {
        self.history.lock().await.iter().cloned().collect()
    }
}
