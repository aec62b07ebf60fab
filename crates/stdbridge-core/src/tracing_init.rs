//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter and optional JSON output.
//! With the `metrics` feature an OpenTelemetry layer can be attached as well.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the env filter: `RUST_LOG` wins over `default_filter`.
fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"stdbridge_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = env_filter(default_filter);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialise tracing and, when `endpoint` is set, the OTLP pipeline.
///
/// Returns the [`MetricsGuard`](crate::metrics::MetricsGuard) when the
/// pipeline was started; keep it alive for the process lifetime. If the
/// exporter cannot be built, logging still comes up and the error is
/// reported through it.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    endpoint: Option<&str>,
) -> Option<crate::metrics::MetricsGuard> {
    use tracing_subscriber::Layer;

    let (guard, init_error) = match endpoint.map(crate::metrics::init_metrics) {
        Some(Ok(guard)) => (Some(guard), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    let fmt_layer = if log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let otel_layer = guard
        .as_ref()
        .map(|g| tracing_opentelemetry::layer().with_tracer(g.tracer("stdbridge")));

    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    if let Some(e) = init_error {
        tracing::warn!(error = %e, "OpenTelemetry pipeline disabled");
    }
    guard
}
