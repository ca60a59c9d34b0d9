//! `TunnelKeeper` Daemon Library
//!
//! Resilient SSH bastion tunnels for the daemon:
//! - Tunnel lifecycle state machine over an injected SSH transport
//! - Health probing, auto-reconnect with backoff
//! - Primary/backup pool with load balancing and failover
//! - Security observation, performance analytics
//! - The [`infra::TunnelInfrastructure`] facade tying them together

pub mod analytics;
pub mod balancer;
pub mod events;
pub mod failover;
pub mod health;
pub mod infra;
pub mod pool;
pub mod reconnect;
pub mod security;
pub mod tracker;
pub mod tunnel;

pub use events::{EventBus, TunnelEvent};
pub use infra::{InfraError, TunnelInfrastructure};
