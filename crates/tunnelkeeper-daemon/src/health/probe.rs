//! Active probes against a tunnel's forwarded local port.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use tunnelkeeper_core::config::HealthSettings;

use crate::tunnel::TunnelId;

/// Raw result of one probe run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeMeasurement {
    /// Mean latency of the successful attempts, `None` if all failed.
    pub latency: Option<Duration>,
    /// Failed attempts over total attempts.
    pub packet_loss: f64,
}

impl ProbeMeasurement {
    pub const fn unreachable() -> Self {
        Self {
            latency: None,
            packet_loss: 1.0,
        }
    }
}

/// Measures latency and loss towards a forwarded port.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, id: TunnelId, target: SocketAddr) -> ProbeMeasurement;
}

/// TCP connect probe: opens `attempts` connections through the forward.
///
/// A connect to the local listener only succeeds while the SSH client is
/// accepting on it, and the round-trip includes the client's accept path.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    attempts: u32,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(attempts: u32, timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            timeout,
        }
    }
}

impl From<&HealthSettings> for TcpProbe {
    fn from(settings: &HealthSettings) -> Self {
        Self::new(
            settings.probe_attempts,
            Duration::from_millis(settings.probe_timeout_ms),
        )
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, id: TunnelId, target: SocketAddr) -> ProbeMeasurement {
        let mut total = Duration::ZERO;
        let mut successes = 0u32;

        for _ in 0..self.attempts {
            let started = Instant::now();
            match tokio::time::timeout(self.timeout, TcpStream::connect(target)).await {
                Ok(Ok(_stream)) => {
                    total += started.elapsed();
                    successes += 1;
                }
                Ok(Err(e)) => debug!(tunnel_id = %id, %target, error = %e, "Probe connect failed"),
                Err(_) => debug!(tunnel_id = %id, %target, "Probe connect timed out"),
            }
        }

        let failures = self.attempts - successes;
        ProbeMeasurement {
            latency: (successes > 0).then(|| total / successes),
            packet_loss: f64::from(failures) / f64::from(self.attempts),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listening_port_has_no_loss() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = TcpProbe::new(3, Duration::from_secs(1));
        let measurement = probe.probe(TunnelId::new(), addr).await;

        assert!(measurement.latency.is_some());
        assert!(measurement.packet_loss.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn closed_port_is_total_loss() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let probe = TcpProbe::new(2, Duration::from_millis(500));
        let measurement = probe.probe(TunnelId::new(), addr).await;

        assert_eq!(measurement, ProbeMeasurement::unreachable());
    }

    #[test]
    fn zero_attempts_clamped() {
        let probe = TcpProbe::from(&HealthSettings {
            probe_attempts: 0,
            ..HealthSettings::default()
        });
        assert_eq!(probe.attempts, 1);
        assert_eq!(probe.timeout, Duration::from_secs(2));
    }
}
