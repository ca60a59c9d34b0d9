//! Outbound event surface.
//!
//! Every component owns an [`EventBus`] and publishes only its own events.
//! The infrastructure facade subscribes to each bus and re-forwards events
//! onto its own bus, which is the only one external collaborators need.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::analytics::{PerformanceAlert, Report};
use crate::failover::{FailoverEvent, FailoverSelection};
use crate::security::SecurityEvent;
use crate::tracker::HealthSample;
use crate::tunnel::{TunnelId, TunnelState};

/// Default per-component broadcast capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events emitted by the tunnel infrastructure.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TunnelEvent {
    TunnelConnected {
        tunnel_id: TunnelId,
        name: String,
    },
    TunnelDisconnected {
        tunnel_id: TunnelId,
        from: TunnelState,
        to: TunnelState,
        reason: String,
    },
    TunnelError {
        tunnel_id: TunnelId,
        /// State the tunnel was left in.
        state: TunnelState,
        error: String,
    },
    ConnectionHealthy {
        sample: HealthSample,
    },
    ConnectionUnhealthy {
        sample: HealthSample,
        consecutive_failures: u32,
    },
    SecurityEvent(SecurityEvent),
    HighThreatDetected(SecurityEvent),
    FailoverSuccessful {
        failover: FailoverEvent,
        selection: FailoverSelection,
    },
    FailoverFailed {
        failover: FailoverEvent,
    },
    PerformanceAlert(PerformanceAlert),
    ReportGenerated(Report),
}

impl TunnelEvent {
    /// Wire name of the event.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TunnelConnected { .. } => "tunnelConnected",
            Self::TunnelDisconnected { .. } => "tunnelDisconnected",
            Self::TunnelError { .. } => "tunnelError",
            Self::ConnectionHealthy { .. } => "connectionHealthy",
            Self::ConnectionUnhealthy { .. } => "connectionUnhealthy",
            Self::SecurityEvent(_) => "securityEvent",
            Self::HighThreatDetected(_) => "highThreatDetected",
            Self::FailoverSuccessful { .. } => "failoverSuccessful",
            Self::FailoverFailed { .. } => "failoverFailed",
            Self::PerformanceAlert(_) => "performanceAlert",
            Self::ReportGenerated(_) => "reportGenerated",
        }
    }

    /// Tunnel the event is about, if it concerns a single tunnel.
    pub fn tunnel_id(&self) -> Option<TunnelId> {
        match self {
            Self::TunnelConnected { tunnel_id, .. }
            | Self::TunnelDisconnected { tunnel_id, .. }
            | Self::TunnelError { tunnel_id, .. } => Some(*tunnel_id),
            Self::ConnectionHealthy { sample } | Self::ConnectionUnhealthy { sample, .. } => {
                Some(sample.tunnel_id)
            }
            Self::SecurityEvent(event) | Self::HighThreatDetected(event) => Some(event.tunnel_id),
            Self::FailoverSuccessful { failover, .. } | Self::FailoverFailed { failover } => {
                Some(failover.failed_tunnel)
            }
            Self::PerformanceAlert(alert) => alert.tunnel_id,
            Self::ReportGenerated(_) => None,
        }
    }
}

/// One component's publish/subscribe channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TunnelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: TunnelEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            debug!(event = name, "No subscribers for event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receive the next event, skipping over lag. Returns `None` once the bus
/// is gone.
pub async fn next_event(rx: &mut broadcast::Receiver<TunnelEvent>) -> Option<TunnelEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event subscriber lagged, skipping events");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
