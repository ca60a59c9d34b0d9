//! Tunnel health probing and classification.

pub mod monitor;
pub mod probe;

use std::time::Duration;

use tunnelkeeper_core::config::HealthSettings;

pub use monitor::{HealthMonitor, HealthSummary};
pub use probe::{HealthProbe, ProbeMeasurement, TcpProbe};

/// Bounds a sample must stay within to count as healthy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub max_latency: Duration,
    pub max_packet_loss: f64,
    /// Bytes per second; zero disables the check.
    pub min_throughput: f64,
}

impl HealthThresholds {
    /// Classify one measurement. An unreachable port is never healthy.
    pub fn is_healthy(&self, measurement: &ProbeMeasurement, throughput: f64) -> bool {
        let Some(latency) = measurement.latency else {
            return false;
        };
        latency <= self.max_latency
            && measurement.packet_loss <= self.max_packet_loss
            && (self.min_throughput <= 0.0 || throughput >= self.min_throughput)
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&HealthSettings::default())
    }
}

impl From<&HealthSettings> for HealthThresholds {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            max_latency: Duration::from_millis(settings.max_latency_ms),
            max_packet_loss: settings.max_packet_loss.clamp(0.0, 1.0),
            min_throughput: settings.min_throughput_bps.max(0.0),
        }
    }
}
