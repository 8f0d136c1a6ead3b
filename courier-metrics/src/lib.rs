//! OpenTelemetry metrics for the courier dispatch layer
//!
//! Exports metrics via OTLP to an OpenTelemetry Collector, which can expose
//! them in Prometheus format for scraping.
//!
//! # Features
//!
//! - **Dispatch Metrics**: Attempt counts, send latency, queue sizes by
//!   status, rate limiter and circuit breaker activity
//! - **OTLP Export**: Push metrics to an OpenTelemetry Collector
//!
//! # Architecture
//!
//! ```text
//! courier → OTLP/HTTP → OpenTelemetry Collector → Prometheus (scrape) → Grafana
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use courier_metrics::{MetricsConfig, init_metrics};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MetricsConfig {
//!     enabled: true,
//!     endpoint: "http://localhost:4318/v1/metrics".to_string(),
//! };
//!
//! init_metrics(&config)?;
//!
//! // Metrics are now pushed to the OpenTelemetry Collector
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatch;
mod error;
mod exporter;

pub use config::MetricsConfig;
pub use dispatch::DispatchMetrics;
pub use error::MetricsError;
use once_cell::sync::OnceCell;

/// Global metrics instance
static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub dispatch: DispatchMetrics,
}

/// Initialize the metrics system
///
/// This must be called once at startup before any metrics are recorded.
/// If metrics are disabled in the config, this is a no-op.
///
/// # Errors
///
/// Returns an error if metrics initialization fails or if called multiple
/// times.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    tracing::info!(
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry metrics with OTLP exporter"
    );

    let provider = exporter::init_otlp_exporter(&config.endpoint)?;

    // Install the provider as the global meter provider
    opentelemetry::global::set_meter_provider(provider);

    let metrics = Metrics {
        dispatch: DispatchMetrics::new(),
    };

    METRICS_INSTANCE
        .set(metrics)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// Get a reference to the global metrics instance
///
/// # Panics
///
/// Panics if metrics have not been initialized via `init_metrics()`.
#[must_use]
#[allow(clippy::expect_used)]
pub fn metrics() -> &'static Metrics {
    METRICS_INSTANCE
        .get()
        .expect("Metrics not initialized. Call init_metrics() first.")
}

/// Get the global metrics instance if one has been initialized
///
/// Instrumented code paths use this so the library works without an
/// exporter: when metrics were never initialized, recording is skipped.
#[must_use]
pub fn try_metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

/// Check if metrics are enabled
#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
