//! Recurring health probe cycle.
//!
//! Every `check_interval` the monitor probes each `CONNECTED` and `DEGRADED`
//! tunnel, records the sample in the [`StateTracker`] and drives the
//! flap-suppressed transitions: the first unhealthy sample degrades a
//! tunnel, `failure_threshold` consecutive ones send it to `RECONNECTING`,
//! a healthy sample restores a degraded tunnel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnelkeeper_core::config::HealthSettings;

use super::probe::{HealthProbe, ProbeMeasurement};
use super::HealthThresholds;
use crate::events::{EventBus, TunnelEvent};
use crate::tracker::{HealthSample, StateTracker};
use crate::tunnel::{TunnelConnection, TunnelId, TunnelManager, TunnelState};

#[derive(Debug, Clone, Copy)]
struct TrafficMark {
    bytes: u64,
    at: SystemTime,
}

#[derive(Debug, Default)]
struct ProbeCounters {
    consecutive_failures: u32,
    last_traffic: Option<TrafficMark>,
}

/// Aggregate health over the tunnels the monitor has seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub unhealthy: usize,
    /// Serving tunnels without a sample yet.
    pub unknown: usize,
    pub mean_latency: Option<Duration>,
    pub monitoring: bool,
}

pub struct HealthMonitor {
    manager: Arc<TunnelManager>,
    tracker: Arc<StateTracker>,
    probe: Arc<dyn HealthProbe>,
    thresholds: HealthThresholds,
    check_interval: Duration,
    failure_threshold: u32,
    parallelism: Arc<Semaphore>,
    events: EventBus,
    counters: Mutex<HashMap<TunnelId, ProbeCounters>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthMonitor {
    pub fn new(
        manager: Arc<TunnelManager>,
        probe: Arc<dyn HealthProbe>,
        settings: &HealthSettings,
    ) -> Self {
        Self {
            tracker: Arc::clone(manager.tracker()),
            manager,
            probe,
            thresholds: HealthThresholds::from(settings),
            check_interval: Duration::from_secs(settings.check_interval_secs.max(1)),
            failure_threshold: settings.failure_threshold.max(1),
            parallelism: Arc::new(Semaphore::new(settings.max_parallel_probes.max(1))),
            events: EventBus::default(),
            counters: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub const fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub const fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Start the recurring probe cycle. No-op if already running.
    pub async fn start_monitoring(self: &Arc<Self>, parent: &CancellationToken) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }

        let token = parent.child_token();
        let monitor = Arc::clone(self);
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = monitor.run_cycle() => {}
                }
            }
            debug!("Health monitor loop exited");
        });

        info!(
            interval_secs = self.check_interval.as_secs_f64(),
            failure_threshold = self.failure_threshold,
            "Health monitoring started"
        );
        *task = Some((token, handle));
    }

    /// Cancel the probe cycle. Tunnels are left as they are.
    pub async fn stop_monitoring(&self) {
        let Some((token, handle)) = self.task.lock().await.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Health monitor task panicked");
        }
        info!("Health monitoring stopped");
    }

    pub async fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Probe every serving, non-quarantined tunnel once.
    pub async fn run_cycle(self: &Arc<Self>) {
        let targets: Vec<TunnelConnection> = self
            .manager
            .list_active_connections()
            .await
            .into_iter()
            .filter(|c| !c.is_quarantined())
            .collect();
        if targets.is_empty() {
            return;
        }

        let mut probes = JoinSet::new();
        for connection in targets {
            let monitor = Arc::clone(self);
            let parallelism = Arc::clone(&self.parallelism);
            probes.spawn(async move {
                let Ok(_permit) = parallelism.acquire_owned().await else {
                    return;
                };
                monitor.probe_connection(&connection).await;
            });
        }
        while let Some(joined) = probes.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Probe task failed");
            }
        }
    }

    /// Probe one tunnel immediately, outside the cycle.
    pub async fn probe_now(&self, id: TunnelId) -> Option<HealthSample> {
        let connection = self.manager.get(id).await?;
        if !connection.is_active() {
            return None;
        }
        Some(self.probe_connection(&connection).await)
    }

    async fn probe_connection(&self, connection: &TunnelConnection) -> HealthSample {
        let id = connection.id;
        let measurement = if self.manager.session_alive(id).await == Some(true) {
            self.probe.probe(id, connection.config.local_addr()).await
        } else {
            debug!(tunnel_id = %id, "SSH session is down");
            ProbeMeasurement::unreachable()
        };

        let now = SystemTime::now();
        let throughput = self.throughput(connection, now).await;
        let sample = HealthSample {
            tunnel_id: id,
            latency: measurement.latency,
            packet_loss: measurement.packet_loss,
            throughput,
            at: now,
            healthy: self.thresholds.is_healthy(&measurement, throughput),
        };

        debug!(
            tunnel_id = %id,
            healthy = sample.healthy,
            latency_ms = sample.latency.map(|l| l.as_millis()),
            loss = sample.packet_loss,
            "Health sample"
        );
        self.record(sample.clone()).await;
        sample
    }

    #[allow(clippy::cast_precision_loss)]
    async fn throughput(&self, connection: &TunnelConnection, now: SystemTime) -> f64 {
        let bytes = connection.bytes_in.saturating_add(connection.bytes_out);
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(connection.id).or_default();
        let previous = entry.last_traffic.unwrap_or(TrafficMark {
            bytes: 0,
            at: connection.created_at,
        });
        entry.last_traffic = Some(TrafficMark { bytes, at: now });

        let elapsed = now.duration_since(previous.at).unwrap_or_default().as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        bytes.saturating_sub(previous.bytes) as f64 / elapsed
    }

    async fn record(&self, sample: HealthSample) {
        let id = sample.tunnel_id;
        self.tracker.record_sample(sample.clone()).await;

        if sample.healthy {
            if let Some(counters) = self.counters.lock().await.get_mut(&id) {
                counters.consecutive_failures = 0;
            }
            if self.manager.state(id).await == Some(TunnelState::Degraded) {
                self.transition(id, TunnelState::Connected, "health recovered")
                    .await;
            }
            self.events.publish(TunnelEvent::ConnectionHealthy { sample });
            return;
        }

        let consecutive_failures = {
            let mut counters = self.counters.lock().await;
            let entry = counters.entry(id).or_default();
            entry.consecutive_failures += 1;
            entry.consecutive_failures
        };
        warn!(
            tunnel_id = %id,
            consecutive_failures,
            threshold = self.failure_threshold,
            "Tunnel unhealthy"
        );
        self.events.publish(TunnelEvent::ConnectionUnhealthy {
            sample,
            consecutive_failures,
        });

        if self.manager.state(id).await == Some(TunnelState::Connected) {
            self.transition(id, TunnelState::Degraded, "health probe failed")
                .await;
        }
        if consecutive_failures >= self.failure_threshold
            && self.manager.state(id).await == Some(TunnelState::Degraded)
        {
            let reason = format!("{consecutive_failures} consecutive unhealthy probes");
            self.transition(id, TunnelState::Reconnecting, &reason).await;
            self.reset(id).await;
        }
    }

    async fn transition(&self, id: TunnelId, to: TunnelState, reason: &str) {
        if let Err(e) = self.manager.transition(id, to, reason).await {
            // Another component moved the tunnel first.
            debug!(tunnel_id = %id, error = %e, "Health transition skipped");
        }
    }

    async fn reset(&self, id: TunnelId) {
        self.counters.lock().await.remove(&id);
    }

    pub async fn consecutive_failures(&self, id: TunnelId) -> u32 {
        self.counters
            .lock()
            .await
            .get(&id)
            .map_or(0, |c| c.consecutive_failures)
    }

    /// Latest verdict per serving tunnel.
    pub async fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary {
            monitoring: self.is_monitoring().await,
            ..HealthSummary::default()
        };
        let mut latency_total = Duration::ZERO;
        let mut latency_count = 0u32;

        for connection in self.manager.list_active_connections().await {
            match self.tracker.last_sample(connection.id).await {
                Some(sample) if sample.healthy => {
                    summary.healthy += 1;
                    if let Some(latency) = sample.latency {
                        latency_total += latency;
                        latency_count += 1;
                    }
                }
                Some(_) => summary.unhealthy += 1,
                None => summary.unknown += 1,
            }
        }
        summary.mean_latency = (latency_count > 0).then(|| latency_total / latency_count);
        summary
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tunnelkeeper_core::KeySource;

    use super::*;
    use crate::tunnel::{
        SshSession, SshTransport, TransportError, TunnelConfig, ValidationOptions,
    };

    struct AliveSession;

    #[async_trait]
    impl SshSession for AliveSession {
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
            Ok(Box::new(AliveSession))
        }
    }

    /// Probe whose verdict is flipped by the test.
    #[derive(Default)]
    struct SwitchProbe {
        down: AtomicBool,
    }

    #[async_trait]
    impl HealthProbe for SwitchProbe {
        async fn probe(&self, _id: TunnelId, _target: std::net::SocketAddr) -> ProbeMeasurement {
            if self.down.load(Ordering::SeqCst) {
                ProbeMeasurement::unreachable()
            } else {
                ProbeMeasurement {
                    latency: Some(Duration::from_millis(15)),
                    packet_loss: 0.0,
                }
            }
        }
    }

    async fn setup(threshold: u32) -> (Arc<TunnelManager>, Arc<SwitchProbe>, Arc<HealthMonitor>, TunnelId) {
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

        let probe = Arc::new(SwitchProbe::default());
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&manager),
            Arc::clone(&probe) as Arc<dyn HealthProbe>,
            &HealthSettings {
                failure_threshold: threshold,
                ..HealthSettings::default()
            },
        ));
        (manager, probe, monitor, tunnel.id)
    }

    #[tokio::test]
    async fn threshold_failures_pass_through_degraded() {
        let (manager, probe, monitor, id) = setup(3).await;
        probe.down.store(true, Ordering::SeqCst);

        monitor.run_cycle().await;
        assert_eq!(manager.state(id).await, Some(TunnelState::Degraded));
        monitor.run_cycle().await;
        assert_eq!(manager.state(id).await, Some(TunnelState::Degraded));
        assert_eq!(monitor.consecutive_failures(id).await, 2);
        monitor.run_cycle().await;
        assert_eq!(manager.state(id).await, Some(TunnelState::Reconnecting));

        let path: Vec<_> = manager
            .tracker()
            .transitions(id)
            .await
            .iter()
            .map(|t| t.to)
            .collect();
        assert_eq!(
            path,
            [
                TunnelState::Connecting,
                TunnelState::Connected,
                TunnelState::Degraded,
                TunnelState::Reconnecting
            ]
        );
        assert_eq!(manager.tracker().samples(id).await.len(), 3);
    }

    #[tokio::test]
    async fn recovery_resets_failure_count() {
        let (manager, probe, monitor, id) = setup(3).await;
        let mut rx = monitor.events().subscribe();

        probe.down.store(true, Ordering::SeqCst);
        monitor.run_cycle().await;
        monitor.run_cycle().await;
        probe.down.store(false, Ordering::SeqCst);
        monitor.run_cycle().await;

        assert_eq!(manager.state(id).await, Some(TunnelState::Connected));
        assert_eq!(monitor.consecutive_failures(id).await, 0);

        let names: Vec<_> = (0..3)
            .map(|_| rx.try_recv().unwrap().name())
            .collect();
        assert_eq!(
            names,
            ["connectionUnhealthy", "connectionUnhealthy", "connectionHealthy"]
        );
    }

    #[tokio::test]
    async fn probe_now_records_sample() {
        let (_manager, _probe, monitor, id) = setup(3).await;
        let sample = monitor.probe_now(id).await.unwrap();
        assert!(sample.healthy);
        assert_eq!(sample.latency, Some(Duration::from_millis(15)));

        let summary = monitor.summary().await;
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.mean_latency, Some(Duration::from_millis(15)));
        assert!(!summary.monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_monitoring() {
        let (manager, probe, monitor, id) = setup(2).await;
        let monitor = Arc::new(
            Arc::into_inner(monitor)
                .unwrap()
                .with_check_interval(Duration::from_secs(5)),
        );
        probe.down.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        monitor.start_monitoring(&cancel).await;
        assert!(monitor.is_monitoring().await);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(manager.state(id).await, Some(TunnelState::Reconnecting));

        monitor.stop_monitoring().await;
        assert!(!monitor.is_monitoring().await);
    }
}
