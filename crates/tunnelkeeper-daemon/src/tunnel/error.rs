//! Tunnel error types.

use std::time::Duration;

use super::config::TunnelId;
use super::state::TunnelState;

/// Errors raised by an SSH transport while opening or closing a session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("SSH client not available: {0}")]
    ClientUnavailable(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Local forward error: {0}")]
    Forward(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in the tunnel manager.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("Tunnel not found: {id}")]
    NotFound { id: TunnelId },

    #[error("Invalid transition for tunnel {id}: {from} -> {to}")]
    InvalidTransition {
        id: TunnelId,
        from: TunnelState,
        to: TunnelState,
    },

    #[error("Tunnel {id} is quarantined")]
    Quarantined { id: TunnelId },

    #[error("Failed to establish tunnel {id}: {source}")]
    Establish {
        id: TunnelId,
        #[source]
        source: TransportError,
    },

    #[error("Timed out establishing tunnel {id} after {timeout:?}")]
    EstablishTimeout { id: TunnelId, timeout: Duration },

    #[error("Tunnel {id} was closed while connecting")]
    ClosedDuringEstablish { id: TunnelId },
}
