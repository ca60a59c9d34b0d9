//! `TunnelKeeper` Core Library
//!
//! Shared functionality for `TunnelKeeper` components:
//! - Configuration resolution and hierarchy
//! - Raw tunnel configuration records
//! - Tracing / metrics initialisation
//! - Common error types

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use config::{Config, KeySource, TunnelConfigInput, TunnelRole};
pub use error::{Error, Result};
