//! `TunnelKeeper` Daemon
//!
//! Keeps a pool of SSH bastion tunnels up and forwards their local ports
//! for the services that consume them.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info, warn};

use tunnelkeeper_daemon::events::next_event;
use tunnelkeeper_daemon::health::TcpProbe;
use tunnelkeeper_daemon::tunnel::OpenSshTransport;
use tunnelkeeper_daemon::{TunnelEvent, TunnelInfrastructure};

#[derive(Parser, Debug)]
#[command(name = "tunnelkeeper")]
#[command(version, about = "TunnelKeeper - resilient SSH bastion tunnels")]
struct Args {
    /// Config file, layered over the global config.
    #[arg(long, env = "TUNNELKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "TUNNELKEEPER_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TUNNELKEEPER_LOG_JSON")]
    log_json: bool,

    /// Run without health, security and analytics monitors.
    #[arg(long, env = "TUNNELKEEPER_NO_MONITORING")]
    no_monitoring: bool,

    /// Seconds to wait for a graceful shutdown before force-closing tunnels.
    #[arg(long, env = "TUNNELKEEPER_SHUTDOWN_TIMEOUT")]
    shutdown_timeout: Option<u64>,

    /// Directory for key material supplied inline in the config.
    #[arg(long, env = "TUNNELKEEPER_KEY_DIR")]
    key_dir: Option<PathBuf>,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "TUNNELKEEPER_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    let log_filter = format!("tunnelkeeper_daemon={}", args.log_level);
    let telemetry = tunnelkeeper_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        metrics_endpoint,
    );

    let mut config = tunnelkeeper_core::config::load_config(args.config.as_deref())?;
    if args.no_monitoring {
        config.infrastructure.enable_monitoring = false;
    }
    if let Some(secs) = args.shutdown_timeout {
        config.infrastructure.shutdown_timeout_secs = secs;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tunnels = config.tunnels.len(),
        monitoring = config.infrastructure.enable_monitoring,
        strategy = ?config.balancer.strategy,
        "Starting tunnelkeeper"
    );

    let mut transport = OpenSshTransport::new(&config.validation.ssh_binary);
    if let Some(dir) = &args.key_dir {
        transport = transport.with_key_dir(dir);
    }
    let probe = TcpProbe::from(&config.health);
    let infra = Arc::new(TunnelInfrastructure::new(
        config,
        Arc::new(transport),
        Arc::new(probe),
    ));

    let event_log = spawn_event_log(&infra);

    let serving = match infra.start().await {
        Ok(serving) => serving,
        Err(e) => {
            error!(error = %e, "Tunnel infrastructure failed to start");
            infra.cleanup().await;
            event_log.abort();
            telemetry.shutdown();
            return Err(e.into());
        }
    };

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the tunnels are up (unix only). The `true`
    // parameter unsets $NOTIFY_SOCKET so spawned ssh clients don't inherit it.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(serving, "Tunnels ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    if let Err(e) = infra.stop().await {
        warn!(error = %e, "Shutdown was not graceful");
    }
    infra.cleanup().await;
    event_log.abort();

    info!("Daemon stopped");
    telemetry.shutdown();
    Ok(())
}

/// Log every facade event; the log is the audit trail.
fn spawn_event_log(infra: &TunnelInfrastructure) -> tokio::task::JoinHandle<()> {
    let mut rx = infra.subscribe();
    #[cfg(feature = "metrics")]
    let counter = tunnelkeeper_core::metrics::EventCounter::new();

    tokio::spawn(async move {
        while let Some(event) = next_event(&mut rx).await {
            #[cfg(feature = "metrics")]
            counter.record(event.name());

            let tunnel_id = event.tunnel_id().map(|id| id.to_string());
            match &event {
                TunnelEvent::HighThreatDetected(_)
                | TunnelEvent::FailoverFailed { .. }
                | TunnelEvent::TunnelError { .. } => {
                    warn!(event = event.name(), tunnel_id = ?tunnel_id, "Tunnel event");
                }
                TunnelEvent::ConnectionHealthy { .. } => {
                    debug!(event = event.name(), tunnel_id = ?tunnel_id, "Tunnel event");
                }
                _ => info!(event = event.name(), tunnel_id = ?tunnel_id, "Tunnel event"),
            }
            match serde_json::to_string(&event) {
                Ok(payload) => debug!(payload = %payload, "Event payload"),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            }
        }
    })
}
