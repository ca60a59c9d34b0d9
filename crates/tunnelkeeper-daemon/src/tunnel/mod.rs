//! SSH tunnel lifecycle.
//!
//! Validates operator input into [`TunnelConfig`]s, owns the resulting
//! [`TunnelConnection`]s and drives them through the [`TunnelState`]
//! machine over an injected [`SshTransport`].

pub mod config;
pub mod error;
pub mod manager;
pub mod state;
pub mod transport;
pub mod validator;

pub use config::{ReconnectPolicy, TunnelConfig, TunnelId};
pub use error::{TransportError, TunnelError};
pub use manager::{TunnelConnection, TunnelManager};
pub use state::TunnelState;
pub use transport::{OpenSshTransport, SshSession, SshTransport};
pub use validator::{ValidationIssue, ValidationOptions, ValidationResult};
