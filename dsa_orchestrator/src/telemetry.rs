//! Logging and telemetry initialization with conditional OpenTelemetry support.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::settings::LoggingConfig;

#[cfg(feature = "with-observability")]
use {
    opentelemetry::KeyValue,
    opentelemetry_otlp::{self as otlp, WithExportConfig},
    opentelemetry_sdk::{propagation::TraceContextPropagator, trace, Resource},
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// `RUST_LOG` wins over the configured level.
fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    Ok(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?)
}

fn fmt_layer(config: &LoggingConfig) -> BoxedLayer {
    match config.format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.enable_target)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_target(config.enable_target)
            .boxed(),
    }
}

/// Install the global subscriber. Call once, before the orchestrator is built.
pub fn init(config: &LoggingConfig, otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = filter(config)?;

    #[cfg(feature = "with-observability")]
    if let Some(endpoint) = otlp_endpoint.filter(|e| !e.is_empty()) {
        return init_with_otlp(config, endpoint, filter);
    }

    init_console_only(config, filter)?;

    #[cfg(not(feature = "with-observability"))]
    if otlp_endpoint.is_some() {
        tracing::warn!("otlp_endpoint is set but the with-observability feature is disabled");
    }

    Ok(())
}

#[cfg(feature = "with-observability")]
fn init_with_otlp(config: &LoggingConfig, endpoint: &str, filter: EnvFilter) -> Result<()> {
    let tracer = otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp::new_exporter().tonic().with_endpoint(endpoint))
        .with_trace_config(trace::config().with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            "dsa_orchestrator",
        )])))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    let subscriber = Registry::default()
        .with(fmt_layer(config))
        .with(filter)
        .with(tracing_opentelemetry::layer().with_tracer(tracer));

    tracing::subscriber::set_global_default(subscriber)?;
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    tracing::info!("Telemetry initialized with OTLP endpoint: {}", endpoint);
    Ok(())
}

fn init_console_only(config: &LoggingConfig, filter: EnvFilter) -> Result<()> {
    let subscriber = Registry::default().with(fmt_layer(config)).with(filter);

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!(format = %config.format, "Console logging initialized");
    Ok(())
}
