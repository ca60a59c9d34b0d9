//! Per-tunnel state transition and health sample history.
//!
//! [`StateTracker`] is the only writer of [`StateTransition`] and
//! [`HealthSample`] records. Both series are append-only and bounded; the
//! oldest entries are pruned first.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::tunnel::{TunnelId, TunnelState};

/// Default number of transitions kept per tunnel.
const DEFAULT_MAX_TRANSITIONS: usize = 256;

/// Default number of health samples kept per tunnel.
const DEFAULT_MAX_SAMPLES: usize = 512;

/// One lifecycle step of a tunnel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub tunnel_id: TunnelId,
    pub from: TunnelState,
    pub to: TunnelState,
    pub at: SystemTime,
    pub reason: String,
}

/// One probe result. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSample {
    pub tunnel_id: TunnelId,
    /// `None` when no probe connection succeeded.
    pub latency: Option<Duration>,
    /// Fraction of failed probe connections, `0.0..=1.0`.
    pub packet_loss: f64,
    /// Bytes per second observed since the previous sample.
    pub throughput: f64,
    pub at: SystemTime,
    pub healthy: bool,
}

#[derive(Default)]
struct TunnelHistory {
    transitions: VecDeque<StateTransition>,
    samples: VecDeque<HealthSample>,
    /// Healthy samples ever recorded, including pruned ones.
    healthy_total: u64,
}

/// Thread-safe, bounded history store keyed by tunnel id.
pub struct StateTracker {
    histories: RwLock<HashMap<TunnelId, TunnelHistory>>,
    max_transitions: usize,
    max_samples: usize,
}

impl StateTracker {
    pub fn new(max_transitions: usize, max_samples: usize) -> Self {
        Self {
            histories: RwLock::new(HashMap::new()),
            max_transitions: max_transitions.max(1),
            max_samples: max_samples.max(1),
        }
    }

    pub(crate) async fn record_transition(&self, transition: StateTransition) {
        let mut histories = self.histories.write().await;
        let history = histories.entry(transition.tunnel_id).or_default();
        if history.transitions.len() >= self.max_transitions {
            history.transitions.pop_front();
        }
        history.transitions.push_back(transition);
    }

    pub(crate) async fn record_sample(&self, sample: HealthSample) {
        let mut histories = self.histories.write().await;
        let history = histories.entry(sample.tunnel_id).or_default();
        if history.samples.len() >= self.max_samples {
            history.samples.pop_front();
        }
        if sample.healthy {
            history.healthy_total += 1;
        }
        history.samples.push_back(sample);
    }

    /// Transitions for a tunnel, oldest first.
    pub async fn transitions(&self, id: TunnelId) -> Vec<StateTransition> {
        self.histories
            .read()
            .await
            .get(&id)
            .map(|h| h.transitions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Health samples for a tunnel, oldest first.
    pub async fn samples(&self, id: TunnelId) -> Vec<HealthSample> {
        self.histories
            .read()
            .await
            .get(&id)
            .map(|h| h.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The most recent `n` samples, oldest first.
    pub async fn recent_samples(&self, id: TunnelId, n: usize) -> Vec<HealthSample> {
        self.histories
            .read()
            .await
            .get(&id)
            .map(|h| {
                let skip = h.samples.len().saturating_sub(n);
                h.samples.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub async fn last_sample(&self, id: TunnelId) -> Option<HealthSample> {
        self.histories
            .read()
            .await
            .get(&id)
            .and_then(|h| h.samples.back().cloned())
    }

    pub async fn last_healthy_sample(&self, id: TunnelId) -> Option<HealthSample> {
        self.histories
            .read()
            .await
            .get(&id)
            .and_then(|h| h.samples.iter().rev().find(|s| s.healthy).cloned())
    }

    /// Number of passed health probes ever recorded for a tunnel.
    pub async fn healthy_sample_count(&self, id: TunnelId) -> u64 {
        self.histories
            .read()
            .await
            .get(&id)
            .map_or(0, |h| h.healthy_total)
    }

    /// Time the tunnel has spent in any of `states`, from its first recorded
    /// transition up to `now`. Returns `(in_states, observed)`.
    pub async fn time_in_states(
        &self,
        id: TunnelId,
        states: &[TunnelState],
        now: SystemTime,
    ) -> (Duration, Duration) {
        let histories = self.histories.read().await;
        let Some(history) = histories.get(&id) else {
            return (Duration::ZERO, Duration::ZERO);
        };
        let Some(first) = history.transitions.front() else {
            return (Duration::ZERO, Duration::ZERO);
        };

        let mut in_states = Duration::ZERO;
        let mut iter = history.transitions.iter().peekable();
        while let Some(current) = iter.next() {
            let until = iter.peek().map_or(now, |next| next.at);
            if states.contains(&current.to) {
                in_states += until.duration_since(current.at).unwrap_or_default();
            }
        }
        let observed = now.duration_since(first.at).unwrap_or_default();
        (in_states, observed)
    }

    /// Drop all but the newest `keep` entries of both series for a tunnel.
    pub async fn prune(&self, id: TunnelId, keep: usize) {
        if let Some(history) = self.histories.write().await.get_mut(&id) {
            while history.transitions.len() > keep {
                history.transitions.pop_front();
            }
            while history.samples.len() > keep {
                history.samples.pop_front();
            }
        }
    }

    /// Remove every record of a tunnel.
    pub async fn forget(&self, id: TunnelId) {
        self.histories.write().await.remove(&id);
    }

    pub async fn clear(&self) {
        self.histories.write().await.clear();
    }

    pub async fn tracked_tunnels(&self) -> Vec<TunnelId> {
        self.histories.read().await.keys().copied().collect()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRANSITIONS, DEFAULT_MAX_SAMPLES)
    }
}
