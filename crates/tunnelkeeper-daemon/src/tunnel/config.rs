//! Normalized tunnel configuration and reconnect policy.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tunnelkeeper_core::config::ReconnectSettings;
use tunnelkeeper_core::{KeySource, TunnelRole};

/// Opaque tunnel identifier. Issued once by the tunnel manager, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(Uuid);

impl TunnelId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Validated, immutable description of one tunnel.
///
/// Only the config validator produces these from operator input; the
/// manager never sees an invalid config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Label used in logs and reports.
    pub name: String,

    pub bastion_host: String,
    pub bastion_port: u16,
    pub bastion_user: String,
    pub private_key: KeySource,

    /// Service reachable only from the bastion.
    pub remote_host: String,
    pub remote_port: u16,

    /// Listener the trading engine connects to.
    pub local_bind: IpAddr,
    pub local_port: u16,

    pub keep_alive: bool,
    pub compression: bool,
    pub connect_timeout: Duration,
    /// SSH-level liveness interval (`ServerAliveInterval`).
    pub keepalive_interval: Duration,
    /// SSH-level liveness retries (`ServerAliveCountMax`).
    pub keepalive_count: u32,

    /// Role the tunnel is registered in when the pool is built.
    pub role: TunnelRole,
}

impl TunnelConfig {
    pub const DEFAULT_BASTION_PORT: u16 = 22;
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_KEEPALIVE_COUNT: u32 = 3;
    pub const DEFAULT_LOCAL_BIND: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// Create a config with required fields and documented defaults.
    pub fn new(
        name: impl Into<String>,
        bastion_host: impl Into<String>,
        bastion_user: impl Into<String>,
        private_key: KeySource,
        remote_host: impl Into<String>,
        remote_port: u16,
        local_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            bastion_host: bastion_host.into(),
            bastion_port: Self::DEFAULT_BASTION_PORT,
            bastion_user: bastion_user.into(),
            private_key,
            remote_host: remote_host.into(),
            remote_port,
            local_bind: Self::DEFAULT_LOCAL_BIND,
            local_port,
            keep_alive: true,
            compression: true,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: Self::DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_count: Self::DEFAULT_KEEPALIVE_COUNT,
            role: TunnelRole::Primary,
        }
    }

    /// Address of the forwarded local listener.
    pub const fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_bind, self.local_port)
    }

    /// `host:port` of the service behind the bastion.
    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// `user@host` destination passed to the SSH client.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.bastion_user, self.bastion_host)
    }
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of reconnect attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_retry_delay_ms),
            max_delay: Duration::from_millis(settings.max_retry_delay_ms),
            // A multiplier below 1 would shrink the delay between attempts.
            multiplier: settings.backoff_multiplier.max(1.0),
            max_attempts: settings.max_retry_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Calculate the delay for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}
