//! Exponential-backoff reconnection of tunnels in `RECONNECTING`.
//!
//! [`AutoReconnect`] listens for `connectionUnhealthy` and
//! `tunnelDisconnected` and runs one retry task per affected tunnel. Each
//! task owns the tunnel's retry budget: success clears its
//! [`ReconnectAttempt`], exhaustion fails the tunnel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, TunnelEvent, next_event};
use crate::tunnel::{ReconnectPolicy, TunnelId, TunnelManager, TunnelState};

/// The pending retry of one tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconnectAttempt {
    pub tunnel_id: TunnelId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub scheduled_at: SystemTime,
    pub delay: Duration,
}

pub struct AutoReconnect {
    manager: Arc<TunnelManager>,
    policy: ReconnectPolicy,
    enabled: AtomicBool,
    attempts: Mutex<HashMap<TunnelId, ReconnectAttempt>>,
    tasks: Mutex<HashMap<TunnelId, JoinHandle<()>>>,
    listener: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    /// Parent of every retry task; cancelled by [`AutoReconnect::shutdown`].
    cancel: Mutex<CancellationToken>,
}

impl AutoReconnect {
    pub fn new(manager: Arc<TunnelManager>, policy: ReconnectPolicy) -> Self {
        Self {
            manager,
            policy,
            enabled: AtomicBool::new(false),
            attempts: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub const fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Start reacting to unhealthy and disconnected tunnels.
    ///
    /// `health_events` is the health monitor's bus; tunnel events come from
    /// the manager. Tunnels already in `RECONNECTING` are picked up at once.
    pub async fn enable(self: &Arc<Self>, parent: &CancellationToken, health_events: &EventBus) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut cancel = self.cancel.lock().await;
            if cancel.is_cancelled() {
                *cancel = parent.child_token();
            }
        }

        let token = parent.child_token();
        let mut tunnel_rx = self.manager.events().subscribe();
        let mut health_rx = health_events.subscribe();
        let this = Arc::clone(self);
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = stop.cancelled() => break,
                    Some(event) = next_event(&mut tunnel_rx) => event,
                    Some(event) = next_event(&mut health_rx) => event,
                    else => break,
                };
                match event {
                    TunnelEvent::TunnelDisconnected { tunnel_id, .. }
                    | TunnelEvent::ConnectionUnhealthy {
                        sample: crate::tracker::HealthSample { tunnel_id, .. },
                        ..
                    } => this.reconnect(tunnel_id).await,
                    _ => {}
                }
            }
            debug!("Auto-reconnect listener exited");
        });
        *self.listener.lock().await = Some((token, handle));

        for connection in self.manager.list_connections().await {
            if connection.state == TunnelState::Reconnecting {
                self.reconnect(connection.id).await;
            }
        }
        info!(
            max_attempts = ?self.policy.max_attempts,
            initial_delay_ms = self.policy.initial_delay.as_millis(),
            "Auto-reconnect enabled"
        );
    }

    /// Stop scheduling new retries. Retries already running continue.
    pub async fn disable(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some((token, handle)) = self.listener.lock().await.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Auto-reconnect listener panicked");
            }
        }
        info!("Auto-reconnect disabled");
    }

    /// Disable and cancel every in-flight retry.
    pub async fn shutdown(&self) {
        self.disable().await;
        self.cancel.lock().await.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "Reconnect task panicked");
            }
        }
        self.attempts.lock().await.clear();
    }

    /// Start a retry task for a tunnel in `RECONNECTING`, unless one is
    /// already running or scheduling is disabled.
    pub async fn reconnect(self: &Arc<Self>, id: TunnelId) {
        if !self.is_enabled() {
            return;
        }
        if self.manager.state(id).await != Some(TunnelState::Reconnecting) {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        if tasks.get(&id).is_some_and(|h| !h.is_finished()) {
            return;
        }
        let cancel = self.cancel.lock().await.child_token();
        let this = Arc::clone(self);
        tasks.insert(
            id,
            tokio::spawn(async move {
                this.retry_loop(id, cancel).await;
                this.attempts.lock().await.remove(&id);
                this.tasks.lock().await.remove(&id);
            }),
        );
    }

    async fn retry_loop(&self, id: TunnelId, cancel: CancellationToken) {
        let mut attempt = 0u32;
        loop {
            if !self.still_reconnecting(id).await {
                return;
            }
            if !self.policy.should_retry(attempt) {
                error!(tunnel_id = %id, attempts = attempt, "Reconnect attempts exhausted");
                if let Err(e) = self
                    .manager
                    .transition(id, TunnelState::Failed, "reconnect attempts exhausted")
                    .await
                {
                    debug!(tunnel_id = %id, error = %e, "Could not fail tunnel");
                }
                return;
            }

            let delay = self.policy.delay_for_attempt(attempt);
            self.attempts.lock().await.insert(
                id,
                ReconnectAttempt {
                    tunnel_id: id,
                    attempt: attempt + 1,
                    scheduled_at: SystemTime::now() + delay,
                    delay,
                },
            );
            info!(
                tunnel_id = %id,
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                "Reconnect scheduled"
            );

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            if !self.still_reconnecting(id).await {
                return;
            }

            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = self.manager.establish_tunnel(id) => result,
            };
            match result {
                Ok(()) => {
                    info!(tunnel_id = %id, attempt = attempt + 1, "Tunnel reconnected");
                    return;
                }
                Err(e) => {
                    warn!(tunnel_id = %id, attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
    }

    async fn still_reconnecting(&self, id: TunnelId) -> bool {
        if self.manager.is_quarantined(id).await {
            info!(tunnel_id = %id, "Tunnel quarantined, abandoning reconnect");
            return false;
        }
        self.manager.state(id).await == Some(TunnelState::Reconnecting)
    }

    /// Live retry record for a tunnel.
    pub async fn attempts(&self, id: TunnelId) -> Option<ReconnectAttempt> {
        self.attempts.lock().await.get(&id).cloned()
    }

    /// Number of tunnels with a retry in flight.
    pub async fn in_flight(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }
}
