//! Shared tracing/logging initialisation.
//!
//! The daemon binary and the integration harnesses use the same pattern
//! for setting up `tracing_subscriber` with an env-filter and optional JSON
//! output. With the `metrics` feature, spans are additionally exported over
//! OTLP.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the telemetry pipeline alive for the lifetime of the process.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "metrics")]
    metrics: Option<crate::metrics::MetricsGuard>,
}

impl TelemetryGuard {
    /// Flush and shut down any exporters. A no-op without the `metrics`
    /// feature or when no endpoint was configured.
    pub fn shutdown(self) {
        #[cfg(feature = "metrics")]
        {
            if let Some(guard) = self.metrics
                && let Err(e) = guard.shutdown()
            {
                tracing::warn!(error = %e, "OpenTelemetry shutdown failed");
            }
        }
    }
}

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"tunnelkeeper_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Like [`init_tracing`], but also wires the OTLP trace/metric exporters
/// when `metrics_endpoint` is set and the `metrics` feature is compiled in.
///
/// Exporter construction failures are logged and the process continues with
/// plain logging.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> TelemetryGuard {
    let Some(endpoint) = metrics_endpoint else {
        init_tracing(default_filter, log_json);
        return TelemetryGuard::default();
    };

    match crate::metrics::init_metrics(endpoint) {
        Ok(guard) => {
            let otel_layer = tracing_opentelemetry::layer().with_tracer(guard.tracer());
            tracing_subscriber::registry()
                .with(env_filter(default_filter))
                .with(otel_layer)
                .with(log_json.then(|| tracing_subscriber::fmt::layer().json()))
                .with((!log_json).then(tracing_subscriber::fmt::layer))
                .init();
            tracing::info!(endpoint, "OpenTelemetry export enabled");
            TelemetryGuard {
                metrics: Some(guard),
            }
        }
        Err(e) => {
            init_tracing(default_filter, log_json);
            tracing::warn!(error = %e, endpoint, "OpenTelemetry export disabled");
            TelemetryGuard::default()
        }
    }
}

/// Without the `metrics` feature the endpoint is ignored.
#[cfg(not(feature = "metrics"))]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    _metrics_endpoint: Option<&str>,
) -> TelemetryGuard {
    init_tracing(default_filter, log_json);
    TelemetryGuard::default()
}
