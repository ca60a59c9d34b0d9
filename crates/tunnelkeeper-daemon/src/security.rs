//! Passive security monitoring of tunnel traffic metadata.
//!
//! The data plane reports [`TrafficObservation`]s; connection churn is read
//! from the tunnel manager's events. Findings at [`Severity::High`] are
//! published as `highThreatDetected` and, with auto-response enabled, the
//! tunnel is quarantined.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnelkeeper_core::config::SecuritySettings;

use crate::events::{EventBus, TunnelEvent, next_event};
use crate::tunnel::{TunnelId, TunnelManager, TunnelState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    /// Traffic reached a peer other than the configured remote service.
    UnexpectedEndpoint { expected: String, observed: String },
    IntegrityViolation { violations: u32, detail: String },
    ConnectionChurn { reconnects: u32, window_secs: u64 },
    TrafficSpike { bytes: u64, limit: u64 },
    /// Audit record of an automatic quarantine.
    Quarantined { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityEvent {
    pub tunnel_id: TunnelId,
    pub severity: Severity,
    pub finding: Finding,
    pub at: SystemTime,
}

/// Traffic metadata reported by whoever carries data over a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficObservation {
    /// `host:port` the traffic actually reached, if known.
    pub remote_endpoint: Option<String>,
    pub bytes: u64,
    /// `false` when a checksum or MAC check failed.
    pub integrity_ok: bool,
    pub detail: Option<String>,
}

impl Default for TrafficObservation {
    fn default() -> Self {
        Self {
            remote_endpoint: None,
            bytes: 0,
            integrity_ok: true,
            detail: None,
        }
    }
}

/// Cumulative security counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecurityMetrics {
    pub observations: u64,
    pub total_events: u64,
    pub high_threats: u64,
    pub unexpected_endpoints: u64,
    pub integrity_violations: u64,
    pub churn_alerts: u64,
    pub traffic_spikes: u64,
    pub auto_responses: u64,
    pub quarantined_tunnels: usize,
}

#[derive(Debug, Default)]
struct TunnelWindow {
    reconnects: VecDeque<Instant>,
    integrity: VecDeque<Instant>,
    traffic: VecDeque<(Instant, u64)>,
}

impl TunnelWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        let expired = |at: &Instant| now.duration_since(*at) > window;
        while self.reconnects.front().is_some_and(expired) {
            self.reconnects.pop_front();
        }
        while self.integrity.front().is_some_and(expired) {
            self.integrity.pop_front();
        }
        while self.traffic.front().is_some_and(|(at, _)| expired(at)) {
            self.traffic.pop_front();
        }
    }

    fn traffic_total(&self) -> u64 {
        self.traffic.iter().map(|(_, b)| b).sum()
    }
}

fn count(items: usize) -> u32 {
    u32::try_from(items).unwrap_or(u32::MAX)
}

pub struct SecurityMonitor {
    manager: Arc<TunnelManager>,
    settings: SecuritySettings,
    window: Duration,
    events: EventBus,
    monitoring: AtomicBool,
    windows: Mutex<HashMap<TunnelId, TunnelWindow>>,
    recent: Mutex<VecDeque<SecurityEvent>>,
    metrics: Mutex<SecurityMetrics>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SecurityMonitor {
    pub fn new(manager: Arc<TunnelManager>, settings: SecuritySettings) -> Self {
        Self {
            manager,
            window: Duration::from_secs(settings.churn_window_secs.max(1)),
            settings,
            events: EventBus::default(),
            monitoring: AtomicBool::new(false),
            windows: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
            metrics: Mutex::new(SecurityMetrics::default()),
            task: Mutex::new(None),
        }
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    pub async fn start_monitoring(self: &Arc<Self>, parent: &CancellationToken) {
        if self.monitoring.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = parent.child_token();
        let mut rx = self.manager.events().subscribe();
        let this = Arc::clone(self);
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = stop.cancelled() => break,
                    event = next_event(&mut rx) => event,
                };
                match event {
                    Some(TunnelEvent::TunnelDisconnected {
                        tunnel_id,
                        to: TunnelState::Reconnecting,
                        ..
                    }) => this.record_reconnect(tunnel_id).await,
                    Some(
                        TunnelEvent::TunnelDisconnected {
                            tunnel_id,
                            to: TunnelState::Closed | TunnelState::Failed,
                            ..
                        }
                        | TunnelEvent::TunnelError {
                            tunnel_id,
                            state: TunnelState::Closed | TunnelState::Failed,
                            ..
                        },
                    ) => this.forget(tunnel_id).await,
                    Some(_) => {}
                    None => break,
                }
            }
            debug!("Security monitor loop exited");
        });
        *self.task.lock().await = Some((token, handle));
        info!(
            auto_response = self.settings.enable_auto_response,
            window_secs = self.window.as_secs(),
            "Security monitoring started"
        );
    }

    pub async fn stop_monitoring(&self) {
        if !self.monitoring.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some((token, handle)) = self.task.lock().await.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Security monitor task panicked");
            }
        }
        info!("Security monitoring stopped");
    }

    /// Inspect one traffic observation. Returns the findings it produced.
    pub async fn observe(&self, id: TunnelId, observation: TrafficObservation) -> Vec<SecurityEvent> {
        if !self.is_monitoring() {
            debug!(tunnel_id = %id, "Security monitor not running, observation ignored");
            return Vec::new();
        }
        let Some(connection) = self.manager.get(id).await else {
            return Vec::new();
        };
        let terminal = connection.state.is_terminal();
        self.metrics.lock().await.observations += 1;

        let mut findings = Vec::new();

        if let Some(observed) = observation.remote_endpoint {
            let expected = connection.config.remote_endpoint();
            if observed != expected {
                findings.push((
                    Severity::High,
                    Finding::UnexpectedEndpoint { expected, observed },
                ));
            }
        }

        {
            let now = Instant::now();
            let mut windows = self.windows.lock().await;
            let window = windows.entry(id).or_default();
            window.prune(now, self.window);

            if !observation.integrity_ok {
                window.integrity.push_back(now);
                let violations = count(window.integrity.len());
                let severity = if violations >= self.settings.integrity_violation_threshold {
                    Severity::High
                } else {
                    Severity::Medium
                };
                findings.push((
                    severity,
                    Finding::IntegrityViolation {
                        violations,
                        detail: observation.detail.unwrap_or_default(),
                    },
                ));
            }

            if observation.bytes > 0 {
                let before = window.traffic_total();
                window.traffic.push_back((now, observation.bytes));
                let after = before.saturating_add(observation.bytes);
                if let Some(limit) = self.settings.max_bytes_per_window
                    && before <= limit
                    && after > limit
                {
                    findings.push((Severity::Medium, Finding::TrafficSpike { bytes: after, limit }));
                }
            }

            if terminal {
                windows.remove(&id);
            }
        }

        let mut emitted = Vec::with_capacity(findings.len());
        for (severity, finding) in findings {
            emitted.push(self.emit(id, severity, finding).await);
        }
        emitted
    }

    async fn record_reconnect(&self, id: TunnelId) {
        let reconnects = {
            let now = Instant::now();
            let mut windows = self.windows.lock().await;
            let window = windows.entry(id).or_default();
            window.prune(now, self.window);
            window.reconnects.push_back(now);
            count(window.reconnects.len())
        };

        let max = self.settings.max_reconnects_per_window;
        let severity = if reconnects == max.saturating_mul(2).saturating_add(1) {
            Severity::High
        } else if reconnects == max.saturating_add(1) {
            Severity::Medium
        } else {
            return;
        };
        self.emit(
            id,
            severity,
            Finding::ConnectionChurn {
                reconnects,
                window_secs: self.window.as_secs(),
            },
        )
        .await;
    }

    async fn emit(&self, id: TunnelId, severity: Severity, finding: Finding) -> SecurityEvent {
        let event = SecurityEvent {
            tunnel_id: id,
            severity,
            finding,
            at: SystemTime::now(),
        };

        {
            let mut metrics = self.metrics.lock().await;
            metrics.total_events += 1;
            match event.finding {
                Finding::UnexpectedEndpoint { .. } => metrics.unexpected_endpoints += 1,
                Finding::IntegrityViolation { .. } => metrics.integrity_violations += 1,
                Finding::ConnectionChurn { .. } => metrics.churn_alerts += 1,
                Finding::TrafficSpike { .. } => metrics.traffic_spikes += 1,
                Finding::Quarantined { .. } => {}
            }
            if severity == Severity::High {
                metrics.high_threats += 1;
            }
        }
        {
            let mut recent = self.recent.lock().await;
            if recent.len() >= self.settings.event_buffer.max(1) {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        if severity == Severity::High {
            error!(tunnel_id = %id, finding = ?event.finding, "High security threat detected");
            self.events.publish(TunnelEvent::HighThreatDetected(event.clone()));
            if self.settings.enable_auto_response {
                self.contain(id, &event.finding).await;
            }
        } else {
            warn!(tunnel_id = %id, ?severity, finding = ?event.finding, "Security event");
            self.events.publish(TunnelEvent::SecurityEvent(event.clone()));
        }
        event
    }

    async fn contain(&self, id: TunnelId, finding: &Finding) {
        if self.manager.is_quarantined(id).await {
            return;
        }
        let reason = match finding {
            Finding::UnexpectedEndpoint { .. } => "unexpected remote endpoint",
            Finding::IntegrityViolation { .. } => "repeated integrity violations",
            Finding::ConnectionChurn { .. } => "abnormal connection churn",
            Finding::TrafficSpike { .. } => "traffic spike",
            Finding::Quarantined { .. } => return,
        };
        if let Err(e) = self.manager.quarantine(id, reason).await {
            warn!(tunnel_id = %id, error = %e, "Automatic containment failed");
            return;
        }

        {
            let mut metrics = self.metrics.lock().await;
            metrics.auto_responses += 1;
            metrics.quarantined_tunnels += 1;
        }
        let audit = SecurityEvent {
            tunnel_id: id,
            severity: Severity::Info,
            finding: Finding::Quarantined {
                reason: reason.to_string(),
            },
            at: SystemTime::now(),
        };
        {
            let mut recent = self.recent.lock().await;
            if recent.len() >= self.settings.event_buffer.max(1) {
                recent.pop_front();
            }
            recent.push_back(audit.clone());
        }
        self.events.publish(TunnelEvent::SecurityEvent(audit));
    }

    /// Lift a quarantine placed by this monitor or an operator.
    pub async fn clear_quarantine(&self, id: TunnelId) -> bool {
        match self.manager.clear_quarantine(id).await {
            Ok(true) => {
                let mut metrics = self.metrics.lock().await;
                metrics.quarantined_tunnels = metrics.quarantined_tunnels.saturating_sub(1);
                self.windows.lock().await.remove(&id);
                true
            }
            Ok(false) | Err(_) => false,
        }
    }

    /// Drop the sliding windows kept for a tunnel that will not serve again.
    pub async fn forget(&self, id: TunnelId) {
        if self.windows.lock().await.remove(&id).is_some() {
            debug!(tunnel_id = %id, "Security windows dropped");
        }
    }

    pub async fn get_security_metrics(&self) -> SecurityMetrics {
        self.metrics.lock().await.clone()
    }

    /// Most recent findings, oldest first.
    pub async fn recent_events(&self) -> Vec<SecurityEvent> {
        self.recent.lock().await.iter().cloned().collect()
    }
}
