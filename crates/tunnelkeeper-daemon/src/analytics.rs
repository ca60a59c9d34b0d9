//! Rolling performance trends, alerts and periodic reports.
//!
//! Analytics only reads: samples and transitions from the [`StateTracker`],
//! snapshots from the [`TunnelManager`] and the failover count. It never
//! changes tunnel state.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnelkeeper_core::config::AnalyticsSettings;

use crate::events::{EventBus, TunnelEvent};
use crate::failover::FailoverManager;
use crate::tracker::{HealthSample, StateTracker};
use crate::tunnel::{TunnelId, TunnelManager, TunnelState};

/// Fewest samples a drift calculation needs.
const MIN_TREND_SAMPLES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LatencyDrift,
    ThroughputDrop,
    FailureRate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceAlert {
    pub tunnel_id: Option<TunnelId>,
    pub kind: AlertKind,
    pub value: f64,
    pub threshold: f64,
    pub at: SystemTime,
}

/// Trend of one tunnel over the sample window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelTrend {
    pub tunnel_id: TunnelId,
    pub samples: usize,
    /// Relative change of mean latency, recent half vs. earlier half.
    pub latency_drift: Option<f64>,
    /// Relative decrease of mean throughput, recent half vs. earlier half.
    pub throughput_drop: Option<f64>,
    pub failure_rate: f64,
    pub mean_latency: Option<Duration>,
}

impl TunnelTrend {
    #[allow(clippy::cast_precision_loss)]
    pub fn from_samples(tunnel_id: TunnelId, samples: &[HealthSample]) -> Self {
        let failures = samples.iter().filter(|s| !s.healthy).count();
        let failure_rate = if samples.is_empty() {
            0.0
        } else {
            failures as f64 / samples.len() as f64
        };

        let latencies: Vec<f64> = samples
            .iter()
            .filter_map(|s| s.latency.map(|l| l.as_secs_f64()))
            .collect();
        let throughputs: Vec<f64> = samples.iter().map(|s| s.throughput).collect();

        let latency_drift = halves(&latencies).and_then(|(earlier, recent)| {
            (earlier > 0.0).then(|| (recent - earlier) / earlier)
        });
        let throughput_drop = halves(&throughputs).and_then(|(earlier, recent)| {
            (earlier > 0.0).then(|| (earlier - recent) / earlier)
        });

        Self {
            tunnel_id,
            samples: samples.len(),
            latency_drift,
            throughput_drop,
            failure_rate,
            mean_latency: mean(&latencies).map(Duration::from_secs_f64),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Means of the earlier and recent halves.
fn halves(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < MIN_TREND_SAMPLES {
        return None;
    }
    let (earlier, recent) = values.split_at(values.len() / 2);
    Some((mean(earlier)?, mean(recent)?))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelReport {
    pub tunnel_id: TunnelId,
    pub name: String,
    pub state: TunnelState,
    pub uptime_ratio: f64,
    pub mean_latency: Option<Duration>,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub generated_at: SystemTime,
    /// Time covered since the previous report.
    pub period: Duration,
    pub total_tunnels: usize,
    pub active_tunnels: usize,
    /// Time spent serving over time observed, across all tunnels.
    pub uptime_ratio: f64,
    pub mean_latency: Option<Duration>,
    pub failover_count: u64,
    pub alerts_raised: u64,
    pub tunnels: Vec<TunnelReport>,
}

pub struct PerformanceAnalytics {
    manager: Arc<TunnelManager>,
    tracker: Arc<StateTracker>,
    failover: Option<Arc<FailoverManager>>,
    settings: AnalyticsSettings,
    events: EventBus,
    /// Alerts currently raised; re-armed once the trend recovers.
    active_alerts: Mutex<HashSet<(TunnelId, AlertKind)>>,
    alerts: Mutex<VecDeque<PerformanceAlert>>,
    reports: Mutex<VecDeque<Report>>,
    alerts_raised: AtomicU64,
    last_report_at: Mutex<SystemTime>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PerformanceAnalytics {
    pub fn new(manager: Arc<TunnelManager>, settings: AnalyticsSettings) -> Self {
        Self {
            tracker: Arc::clone(manager.tracker()),
            manager,
            failover: None,
            settings,
            events: EventBus::default(),
            active_alerts: Mutex::new(HashSet::new()),
            alerts: Mutex::new(VecDeque::new()),
            reports: Mutex::new(VecDeque::new()),
            alerts_raised: AtomicU64::new(0),
            last_report_at: Mutex::new(SystemTime::now()),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_failover(mut self, failover: Arc<FailoverManager>) -> Self {
        self.failover = Some(failover);
        self
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|(_, h)| !h.is_finished()) {
            return;
        }
        *self.last_report_at.lock().await = SystemTime::now();

        let token = parent.child_token();
        let stop = token.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let collect_every = Duration::from_secs(this.settings.collection_interval_secs.max(1));
            let report_every = Duration::from_secs(this.settings.report_interval_secs.max(1));
            let mut collect = tokio::time::interval_at(tokio::time::Instant::now() + collect_every, collect_every);
            let mut report = tokio::time::interval_at(tokio::time::Instant::now() + report_every, report_every);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = collect.tick() => {
                        this.collect().await;
                    }
                    _ = report.tick(), if this.settings.enable_auto_reporting => {
                        this.generate_report().await;
                    }
                }
            }
            debug!("Analytics loop exited");
        });
        *task = Some((token, handle));
        info!(
            collection_secs = self.settings.collection_interval_secs,
            auto_reporting = self.settings.enable_auto_reporting,
            "Performance analytics started"
        );
    }

    pub async fn stop(&self) {
        let Some((token, handle)) = self.task.lock().await.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Analytics task panicked");
        }
        info!("Performance analytics stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|(_, h)| !h.is_finished())
    }

    /// Trends of every serving tunnel.
    pub async fn trends(&self) -> Vec<TunnelTrend> {
        let mut trends = Vec::new();
        for connection in self.manager.list_active_connections().await {
            let samples = self
                .tracker
                .recent_samples(connection.id, self.settings.window_samples)
                .await;
            trends.push(TunnelTrend::from_samples(connection.id, &samples));
        }
        trends
    }

    /// Compute trends and raise alerts for those crossing their bound.
    /// Returns the alerts raised by this collection.
    pub async fn collect(&self) -> Vec<PerformanceAlert> {
        let mut raised = Vec::new();
        for trend in self.trends().await {
            let checks = [
                (
                    AlertKind::LatencyDrift,
                    trend.latency_drift,
                    self.settings.latency_drift_threshold,
                ),
                (
                    AlertKind::ThroughputDrop,
                    trend.throughput_drop,
                    self.settings.throughput_drop_threshold,
                ),
                (
                    AlertKind::FailureRate,
                    (trend.samples > 0).then_some(trend.failure_rate),
                    self.settings.failure_rate_threshold,
                ),
            ];

            for (kind, value, threshold) in checks {
                let key = (trend.tunnel_id, kind);
                let crossed = value.is_some_and(|v| v > threshold);
                let mut active = self.active_alerts.lock().await;
                if !crossed {
                    active.remove(&key);
                    continue;
                }
                if !active.insert(key) {
                    continue;
                }
                drop(active);

                let alert = PerformanceAlert {
                    tunnel_id: Some(trend.tunnel_id),
                    kind,
                    value: value.unwrap_or_default(),
                    threshold,
                    at: SystemTime::now(),
                };
                warn!(
                    tunnel_id = %trend.tunnel_id,
                    ?kind,
                    value = alert.value,
                    threshold,
                    "Performance alert"
                );
                self.push_alert(alert.clone()).await;
                self.events.publish(TunnelEvent::PerformanceAlert(alert.clone()));
                raised.push(alert);
            }
        }

        let live: HashSet<TunnelId> = self
            .manager
            .list_connections()
            .await
            .into_iter()
            .filter(|c| !c.state.is_terminal())
            .map(|c| c.id)
            .collect();
        self.active_alerts
            .lock()
            .await
            .retain(|(id, _)| live.contains(id));
        raised
    }

    /// Drop alert state kept for a retired tunnel.
    pub async fn forget(&self, id: TunnelId) {
        self.active_alerts
            .lock()
            .await
            .retain(|(tunnel, _)| *tunnel != id);
    }

    async fn push_alert(&self, alert: PerformanceAlert) {
        self.alerts_raised.fetch_add(1, Ordering::SeqCst);
        let mut alerts = self.alerts.lock().await;
        if alerts.len() >= self.settings.history_capacity.max(1) {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }

    /// Build, store and publish a summary report.
    #[allow(clippy::cast_precision_loss)]
    pub async fn generate_report(&self) -> Report {
        let now = SystemTime::now();
        let period = {
            let mut last = self.last_report_at.lock().await;
            let period = now.duration_since(*last).unwrap_or_default();
            *last = now;
            period
        };

        let connections = self.manager.list_connections().await;
        let mut served = Duration::ZERO;
        let mut observed = Duration::ZERO;
        let mut latency_total = Duration::ZERO;
        let mut latency_count = 0u32;
        let mut tunnels = Vec::with_capacity(connections.len());

        for connection in &connections {
            let (up, seen) = self
                .tracker
                .time_in_states(
                    connection.id,
                    &[TunnelState::Connected, TunnelState::Degraded],
                    now,
                )
                .await;
            served += up;
            observed += seen;

            let samples = self
                .tracker
                .recent_samples(connection.id, self.settings.window_samples)
                .await;
            let trend = TunnelTrend::from_samples(connection.id, &samples);
            if let Some(latency) = trend.mean_latency {
                latency_total += latency;
                latency_count += 1;
            }
            tunnels.push(TunnelReport {
                tunnel_id: connection.id,
                name: connection.name.clone(),
                state: connection.state,
                uptime_ratio: ratio(up, seen),
                mean_latency: trend.mean_latency,
                failure_rate: trend.failure_rate,
            });
        }

        let report = Report {
            generated_at: now,
            period,
            total_tunnels: connections.len(),
            active_tunnels: connections.iter().filter(|c| c.is_active()).count(),
            uptime_ratio: ratio(served, observed),
            mean_latency: (latency_count > 0).then(|| latency_total / latency_count),
            failover_count: self.failover.as_ref().map_or(0, |f| f.failover_count()),
            alerts_raised: self.alerts_raised.load(Ordering::SeqCst),
            tunnels,
        };

        info!(
            total = report.total_tunnels,
            active = report.active_tunnels,
            uptime = report.uptime_ratio,
            failovers = report.failover_count,
            "Performance report generated"
        );
        {
            let mut reports = self.reports.lock().await;
            if reports.len() >= self.settings.history_capacity.max(1) {
                reports.pop_front();
            }
            reports.push_back(report.clone());
        }
        self.events.publish(TunnelEvent::ReportGenerated(report.clone()));
        report
    }

    pub async fn latest_report(&self) -> Option<Report> {
        self.reports.lock().await.back().cloned()
    }

    /// Alerts raised so far, oldest first.
    pub async fn alerts(&self) -> Vec<PerformanceAlert> {
        self.alerts.lock().await.iter().cloned().collect()
    }
}

fn ratio(part: Duration, whole: Duration) -> f64 {
    if whole.is_zero() {
        0.0
    } else {
        part.as_secs_f64() / whole.as_secs_f64()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use tunnelkeeper_core::KeySource;

    use super::*;
    use crate::tunnel::{
        SshSession, SshTransport, TransportError, TunnelConfig, ValidationOptions,
    };

    fn sample(id: TunnelId, latency_ms: u64, throughput: f64, healthy: bool) -> HealthSample {
        HealthSample {
            tunnel_id: id,
            latency: Some(Duration::from_millis(latency_ms)),
            packet_loss: 0.0,
            throughput,
            at: SystemTime::now(),
            healthy,
        }
    }

    #[test]
    fn trend_halves() {
        let id = TunnelId::new();
        let samples: Vec<_> = [10, 10, 20, 20]
            .iter()
            .map(|ms| sample(id, *ms, 1_000.0, true))
            .collect();
        let trend = TunnelTrend::from_samples(id, &samples);

        assert!((trend.latency_drift.unwrap() - 1.0).abs() < 1e-9);
        assert!(trend.throughput_drop.unwrap().abs() < 1e-9);
        assert!(trend.failure_rate.abs() < f64::EPSILON);
        assert_eq!(trend.mean_latency, Some(Duration::from_millis(15)));
    }

    #[test]
    fn short_window_has_no_drift() {
        let id = TunnelId::new();
        let samples = vec![sample(id, 10, 0.0, true), sample(id, 50, 0.0, false)];
        let trend = TunnelTrend::from_samples(id, &samples);
        assert!(trend.latency_drift.is_none());
        assert!((trend.failure_rate - 0.5).abs() < f64::EPSILON);
    }

    struct NullSession;

    #[async_trait]
    impl SshSession for NullSession {
        fn is_alive(&mut self) -> bool {
            true
        }

        async fn close(self: Box<Self>, _grace: Duration) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct AlwaysUp;

    #[async_trait]
    impl SshTransport for AlwaysUp {
        async fn open(
            &self,
            _id: TunnelId,
            _config: &TunnelConfig,
        ) -> Result<Box<dyn SshSession>, TransportError> {
            Ok(Box::new(NullSession))
        }
    }

    async fn setup() -> (Arc<TunnelManager>, PerformanceAnalytics, TunnelId) {
        let manager = Arc::new(TunnelManager::new(
            Arc::new(AlwaysUp),
            Arc::new(StateTracker::default()),
            ValidationOptions::default(),
        ));
        let tunnel = manager
            .register(TunnelConfig::new(
                "a",
                "10.0.0.5",
                "trader",
                KeySource::Path("/keys/id".into()),
                "api.exchange.internal",
                443,
                18443,
            ))
            .await;
        manager.establish_tunnel(tunnel.id).await.unwrap();
        let analytics = PerformanceAnalytics::new(Arc::clone(&manager), AnalyticsSettings::default());
        (manager, analytics, tunnel.id)
    }

    #[tokio::test]
    async fn alert_raised_once_and_rearmed_after_recovery() {
        let (manager, analytics, id) = setup().await;
        let mut rx = analytics.events().subscribe();
        for ms in [10, 10, 40, 40] {
            manager.tracker().record_sample(sample(id, ms, 0.0, true)).await;
        }

        let raised = analytics.collect().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlertKind::LatencyDrift);
        assert_eq!(rx.try_recv().unwrap().name(), "performanceAlert");

        // Still drifting: no duplicate.
        assert!(analytics.collect().await.is_empty());

        // Recovery clears the alert.
        manager.tracker().prune(id, 0).await;
        for _ in 0..4 {
            manager.tracker().record_sample(sample(id, 10, 0.0, true)).await;
        }
        assert!(analytics.collect().await.is_empty());

        manager.tracker().prune(id, 0).await;
        for ms in [10, 10, 40, 40] {
            manager.tracker().record_sample(sample(id, ms, 0.0, true)).await;
        }
        assert_eq!(analytics.collect().await.len(), 1);
        assert_eq!(analytics.alerts().await.len(), 2);
    }

    #[tokio::test]
    async fn closed_tunnel_alerts_are_pruned() {
        let (manager, analytics, id) = setup().await;
        for ms in [10, 10, 40, 40] {
            manager.tracker().record_sample(sample(id, ms, 0.0, true)).await;
        }
        assert_eq!(analytics.collect().await.len(), 1);
        assert_eq!(analytics.active_alerts.lock().await.len(), 1);

        manager.close_tunnel(id).await.unwrap();
        assert!(analytics.collect().await.is_empty());
        assert!(analytics.active_alerts.lock().await.is_empty());
        assert_eq!(analytics.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn failure_rate_alert() {
        let (manager, analytics, id) = setup().await;
        for healthy in [true, false, false] {
            manager.tracker().record_sample(sample(id, 10, 0.0, healthy)).await;
        }
        let raised = analytics.collect().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlertKind::FailureRate);
    }

    #[tokio::test]
    async fn report_summarises_pool() {
        let (manager, analytics, id) = setup().await;
        manager.tracker().record_sample(sample(id, 30, 0.0, true)).await;
        let mut rx = analytics.events().subscribe();

        let report = analytics.generate_report().await;
        assert_eq!(report.total_tunnels, 1);
        assert_eq!(report.active_tunnels, 1);
        assert_eq!(report.failover_count, 0);
        assert_eq!(report.mean_latency, Some(Duration::from_millis(30)));
        assert!(report.uptime_ratio > 0.0 && report.uptime_ratio <= 1.0);
        assert_eq!(report.tunnels[0].state, TunnelState::Connected);

        assert_eq!(rx.try_recv().unwrap().name(), "reportGenerated");
        assert_eq!(analytics.latest_report().await.unwrap(), report);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_reporting_on_interval() {
        let (_manager, analytics, _id) = setup().await;
        let analytics = Arc::new(PerformanceAnalytics {
            settings: AnalyticsSettings {
                report_interval_secs: 10,
                collection_interval_secs: 5,
                ..AnalyticsSettings::default()
            },
            ..analytics
        });
        let cancel = CancellationToken::new();
        analytics.start(&cancel).await;
        assert!(analytics.is_running().await);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(analytics.reports.lock().await.len(), 2);

        cancel.cancel();
        analytics.stop().await;
        assert!(!analytics.is_running().await);
    }
}
