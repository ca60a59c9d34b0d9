//! Tunnel manager: owner of every tunnel connection.
//!
//! Connections live in an arena keyed by [`TunnelId`]. Other components hold
//! identifiers only and read fresh snapshots. Every state change goes
//! through [`TunnelManager::transition`], which validates the step, mirrors
//! it into the [`StateTracker`] and publishes the matching event while the
//! arena lock is held, so transitions of one tunnel are strictly ordered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tunnelkeeper_core::TunnelConfigInput;

use super::config::{TunnelConfig, TunnelId};
use super::error::TunnelError;
use super::state::TunnelState;
use super::transport::{SshSession, SshTransport};
use super::validator::{self, ValidationOptions};
use crate::events::{EventBus, TunnelEvent};
use crate::tracker::{StateTracker, StateTransition};

/// Extra time allowed on top of a config's connect timeout before an
/// establishment attempt is abandoned.
const ESTABLISH_SLACK: Duration = Duration::from_secs(5);

/// Default grace period for an SSH session to exit on close.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Read-only snapshot of one tunnel connection.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelConnection {
    pub id: TunnelId,
    #[serde(skip)]
    pub config: Arc<TunnelConfig>,
    pub name: String,
    pub state: TunnelState,
    pub created_at: SystemTime,
    pub last_activity: SystemTime,
    pub last_error: Option<String>,
    /// Reason the tunnel was quarantined, if it is.
    pub quarantine: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl TunnelConnection {
    pub const fn is_active(&self) -> bool {
        self.state.is_serving()
    }

    pub const fn is_quarantined(&self) -> bool {
        self.quarantine.is_some()
    }
}

struct TunnelEntry {
    connection: TunnelConnection,
    session: Option<Box<dyn SshSession>>,
}

/// Owns tunnel connections and their SSH sessions.
pub struct TunnelManager {
    tunnels: RwLock<HashMap<TunnelId, TunnelEntry>>,
    transport: Arc<dyn SshTransport>,
    tracker: Arc<StateTracker>,
    events: EventBus,
    validation: ValidationOptions,
    close_grace: Duration,
}

impl TunnelManager {
    pub fn new(
        transport: Arc<dyn SshTransport>,
        tracker: Arc<StateTracker>,
        validation: ValidationOptions,
    ) -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
            transport,
            tracker,
            events: EventBus::default(),
            validation,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }

    #[must_use]
    pub const fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub const fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    /// Validate raw input and register a new `PENDING` tunnel.
    ///
    /// No socket is opened until [`establish_tunnel`](Self::establish_tunnel).
    pub async fn create_tunnel(
        &self,
        input: &TunnelConfigInput,
    ) -> Result<TunnelConnection, TunnelError> {
        let result = validator::validate(input, &self.validation);
        for warning in &result.warnings {
            warn!(field = %warning.field, "Tunnel config warning: {}", warning.message);
        }
        let config = result.into_config()?;
        Ok(self.register(config).await)
    }

    /// Register an already validated config as a new `PENDING` tunnel.
    pub async fn register(&self, config: TunnelConfig) -> TunnelConnection {
        let id = TunnelId::new();
        let now = SystemTime::now();
        let connection = TunnelConnection {
            id,
            name: config.name.clone(),
            config: Arc::new(config),
            state: TunnelState::Pending,
            created_at: now,
            last_activity: now,
            last_error: None,
            quarantine: None,
            bytes_in: 0,
            bytes_out: 0,
        };

        info!(
            tunnel_id = %id,
            name = %connection.name,
            local = %connection.config.local_addr(),
            remote = %connection.config.remote_endpoint(),
            "Tunnel registered"
        );

        self.tunnels.write().await.insert(
            id,
            TunnelEntry {
                connection: connection.clone(),
                session: None,
            },
        );
        connection
    }

    /// Open the SSH session and local forward for a `PENDING` or
    /// `RECONNECTING` tunnel.
    ///
    /// A failure from `PENDING` fails the tunnel. A failure while
    /// reconnecting returns it to `RECONNECTING`; retrying is up to the
    /// caller. Establishing an already serving tunnel is a no-op.
    pub async fn establish_tunnel(&self, id: TunnelId) -> Result<(), TunnelError> {
        let (config, reconnecting) = {
            let mut tunnels = self.tunnels.write().await;
            let entry = tunnels.get(&id).ok_or(TunnelError::NotFound { id })?;
            if entry.connection.is_quarantined() {
                return Err(TunnelError::Quarantined { id });
            }
            let from = entry.connection.state;
            match from {
                TunnelState::Connected | TunnelState::Degraded => return Ok(()),
                TunnelState::Pending | TunnelState::Reconnecting => {}
                _ => {
                    return Err(TunnelError::InvalidTransition {
                        id,
                        from,
                        to: TunnelState::Connecting,
                    });
                }
            }
            let config = Arc::clone(&entry.connection.config);
            let reason = if from == TunnelState::Reconnecting {
                "reconnect attempt"
            } else {
                "establishing"
            };
            self.apply(&mut tunnels, id, TunnelState::Connecting, reason)
                .await?;
            (config, from == TunnelState::Reconnecting)
        };

        debug!(tunnel_id = %id, reconnecting, "Opening SSH session");
        let timeout = config.connect_timeout + ESTABLISH_SLACK;
        let opened = tokio::time::timeout(timeout, self.transport.open(id, &config)).await;

        let (result, discard) = {
            let mut tunnels = self.tunnels.write().await;
            let still_connecting = tunnels
                .get(&id)
                .is_some_and(|e| e.connection.state == TunnelState::Connecting);

            if still_connecting {
                let error = match opened {
                    Ok(Ok(session)) => {
                        if let Some(entry) = tunnels.get_mut(&id) {
                            entry.session = Some(session);
                            entry.connection.last_error = None;
                            entry.connection.last_activity = SystemTime::now();
                        }
                        self.apply(&mut tunnels, id, TunnelState::Connected, "established")
                            .await?;
                        None
                    }
                    Ok(Err(source)) => Some(TunnelError::Establish { id, source }),
                    Err(_) => Some(TunnelError::EstablishTimeout { id, timeout }),
                };

                match error {
                    None => (Ok(()), None),
                    Some(err) => {
                        let message = err.to_string();
                        if let Some(entry) = tunnels.get_mut(&id) {
                            entry.connection.last_error = Some(message.clone());
                        }
                        let next = if reconnecting {
                            TunnelState::Reconnecting
                        } else {
                            TunnelState::Failed
                        };
                        self.apply(&mut tunnels, id, next, &message).await?;
                        (Err(err), None)
                    }
                }
            } else {
                // Closed (or removed) while the handshake was in flight.
                let discard = match opened {
                    Ok(Ok(session)) => Some(session),
                    _ => None,
                };
                (Err(TunnelError::ClosedDuringEstablish { id }), discard)
            }
        };

        if let Some(session) = discard {
            self.close_session(id, session).await;
        }
        if let Err(ref e) = result {
            warn!(tunnel_id = %id, error = %e, "Tunnel establishment failed");
        }
        result
    }

    /// Tear a tunnel down. Closing an already closed tunnel is a no-op.
    pub async fn close_tunnel(&self, id: TunnelId) -> Result<(), TunnelError> {
        self.close_with_reason(id, "closed").await
    }

    pub(crate) async fn close_with_reason(
        &self,
        id: TunnelId,
        reason: &str,
    ) -> Result<(), TunnelError> {
        if self.state(id).await.ok_or(TunnelError::NotFound { id })? == TunnelState::Closed {
            return Ok(());
        }
        match self.transition(id, TunnelState::Closed, reason).await {
            Ok(_) => Ok(()),
            // Lost a race with another closer.
            Err(TunnelError::InvalidTransition {
                from: TunnelState::Closed,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Close every tunnel that is not already closed.
    pub async fn close_all(&self, reason: &str) {
        let mut sessions = JoinSet::new();
        {
            let mut tunnels = self.tunnels.write().await;
            let ids: Vec<TunnelId> = tunnels
                .iter()
                .filter(|(_, e)| e.connection.state != TunnelState::Closed)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Err(e) = self.apply(&mut tunnels, id, TunnelState::Closed, reason).await {
                    warn!(tunnel_id = %id, error = %e, "Failed to close tunnel");
                }
                if let Some(session) = tunnels.get_mut(&id).and_then(|e| e.session.take()) {
                    let grace = self.close_grace;
                    sessions.spawn(async move { (id, session.close(grace).await) });
                }
            }
        }

        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok((id, Err(e))) => warn!(tunnel_id = %id, error = %e, "Error closing SSH session"),
                Ok((_, Ok(()))) => {}
                Err(e) => warn!(error = %e, "Session close task panicked"),
            }
        }
    }

    /// The single mutation path for tunnel state.
    ///
    /// Returns the state the tunnel left. Entering `RECONNECTING`, `FAILED`
    /// or `CLOSED` releases the tunnel's SSH session.
    pub async fn transition(
        &self,
        id: TunnelId,
        to: TunnelState,
        reason: &str,
    ) -> Result<TunnelState, TunnelError> {
        let (from, session) = {
            let mut tunnels = self.tunnels.write().await;
            let from = self.apply(&mut tunnels, id, to, reason).await?;
            let session = if matches!(
                to,
                TunnelState::Reconnecting | TunnelState::Failed | TunnelState::Closed
            ) {
                tunnels.get_mut(&id).and_then(|e| e.session.take())
            } else {
                None
            };
            (from, session)
        };

        if let Some(session) = session {
            self.close_session(id, session).await;
        }
        Ok(from)
    }

    async fn apply(
        &self,
        tunnels: &mut HashMap<TunnelId, TunnelEntry>,
        id: TunnelId,
        to: TunnelState,
        reason: &str,
    ) -> Result<TunnelState, TunnelError> {
        let entry = tunnels.get_mut(&id).ok_or(TunnelError::NotFound { id })?;
        let from = entry.connection.state;
        if !from.can_transition_to(to) {
            return Err(TunnelError::InvalidTransition { id, from, to });
        }
        entry.connection.state = to;
        let name = entry.connection.name.clone();

        info!(tunnel_id = %id, name = %name, %from, %to, reason, "Tunnel state changed");

        self.tracker
            .record_transition(StateTransition {
                tunnel_id: id,
                from,
                to,
                at: SystemTime::now(),
                reason: reason.to_string(),
            })
            .await;

        if let Some(event) = transition_event(id, name, from, to, reason) {
            self.events.publish(event);
        }
        Ok(from)
    }

    async fn close_session(&self, id: TunnelId, session: Box<dyn SshSession>) {
        if let Err(e) = session.close(self.close_grace).await {
            warn!(tunnel_id = %id, error = %e, "Error closing SSH session");
        }
    }

    /// Close a tunnel and bar it from reconnection and selection until the
    /// quarantine is cleared.
    pub async fn quarantine(&self, id: TunnelId, reason: &str) -> Result<(), TunnelError> {
        {
            let mut tunnels = self.tunnels.write().await;
            let entry = tunnels.get_mut(&id).ok_or(TunnelError::NotFound { id })?;
            entry.connection.quarantine = Some(reason.to_string());
        }
        warn!(tunnel_id = %id, reason, "Tunnel quarantined");
        self.close_with_reason(id, &format!("quarantined: {reason}"))
            .await
    }

    /// Lift a quarantine. Returns whether the tunnel was quarantined.
    pub async fn clear_quarantine(&self, id: TunnelId) -> Result<bool, TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        let entry = tunnels.get_mut(&id).ok_or(TunnelError::NotFound { id })?;
        let was = entry.connection.quarantine.take().is_some();
        if was {
            info!(tunnel_id = %id, "Tunnel quarantine cleared");
        }
        Ok(was)
    }

    pub async fn is_quarantined(&self, id: TunnelId) -> bool {
        self.tunnels
            .read()
            .await
            .get(&id)
            .is_some_and(|e| e.connection.is_quarantined())
    }

    /// Account traffic carried by a tunnel's forward.
    pub async fn record_activity(
        &self,
        id: TunnelId,
        bytes_in: u64,
        bytes_out: u64,
    ) -> Result<(), TunnelError> {
        let mut tunnels = self.tunnels.write().await;
        let entry = tunnels.get_mut(&id).ok_or(TunnelError::NotFound { id })?;
        entry.connection.bytes_in = entry.connection.bytes_in.saturating_add(bytes_in);
        entry.connection.bytes_out = entry.connection.bytes_out.saturating_add(bytes_out);
        entry.connection.last_activity = SystemTime::now();
        Ok(())
    }

    /// Whether the tunnel's SSH session is still up. `None` for unknown ids.
    pub async fn session_alive(&self, id: TunnelId) -> Option<bool> {
        let mut tunnels = self.tunnels.write().await;
        let entry = tunnels.get_mut(&id)?;
        Some(entry.session.as_mut().is_some_and(|s| s.is_alive()))
    }

    pub async fn get(&self, id: TunnelId) -> Option<TunnelConnection> {
        self.tunnels
            .read()
            .await
            .get(&id)
            .map(|e| e.connection.clone())
    }

    pub async fn state(&self, id: TunnelId) -> Option<TunnelState> {
        self.tunnels.read().await.get(&id).map(|e| e.connection.state)
    }

    pub async fn list_connections(&self) -> Vec<TunnelConnection> {
        let mut list: Vec<TunnelConnection> = self
            .tunnels
            .read()
            .await
            .values()
            .map(|e| e.connection.clone())
            .collect();
        list.sort_by_key(|c| c.created_at);
        list
    }

    /// Tunnels in `CONNECTED` or `DEGRADED`.
    pub async fn list_active_connections(&self) -> Vec<TunnelConnection> {
        let mut list = self.list_connections().await;
        list.retain(TunnelConnection::is_active);
        list
    }

    pub async fn count_by_state(&self) -> HashMap<TunnelState, usize> {
        let mut counts = HashMap::new();
        for entry in self.tunnels.read().await.values() {
            *counts.entry(entry.connection.state).or_insert(0) += 1;
        }
        counts
    }
}

/// Outbound event for a transition, if it has one.
fn transition_event(
    id: TunnelId,
    name: String,
    from: TunnelState,
    to: TunnelState,
    reason: &str,
) -> Option<TunnelEvent> {
    match (from, to) {
        (TunnelState::Connecting, TunnelState::Connected) => Some(TunnelEvent::TunnelConnected {
            tunnel_id: id,
            name,
        }),
        (_, TunnelState::Closed) | (TunnelState::Degraded, TunnelState::Reconnecting) => {
            Some(TunnelEvent::TunnelDisconnected {
                tunnel_id: id,
                from,
                to,
                reason: reason.to_string(),
            })
        }
        (_, TunnelState::Failed) | (TunnelState::Connecting, TunnelState::Reconnecting) => {
            Some(TunnelEvent::TunnelError {
                tunnel_id: id,
                state: to,
                error: reason.to_string(),
            })
        }
        _ => None,
    }
}
