use opentelemetry::trace::TracerProvider as TracerProviderTrait;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where and how a fleet binary emits its logs and traces.
#[derive(Debug, Clone)]
pub struct TelemetryConfig<'a> {
    /// Identifies this component in exported spans (e.g. "fleet-orchestrator").
    pub service_name: &'a str,
    /// OTLP/HTTP base URL; the exporter appends `/v1/traces`. None keeps logs local.
    pub otlp_endpoint: Option<&'a str>,
    /// Bearer token sent with exported spans.
    pub otlp_token: Option<&'a str>,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: &'a str,
}

/// Install the global tracing subscriber.
///
/// Returns the tracer provider when OTLP export is enabled; the caller keeps
/// it alive and calls `shutdown()` before exit so buffered spans are flushed.
pub fn init_tracing(cfg: &TelemetryConfig<'_>) -> Option<TracerProvider> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

    let Some(endpoint) = cfg.otlp_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
        return None;
    };

    let mut headers = std::collections::HashMap::new();
    if let Some(token) = cfg.otlp_token.filter(|t| !t.is_empty()) {
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    }

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .with_headers(headers)
        .build()
    {
        Ok(e) => e,
        Err(err) => {
            eprintln!("failed to create OTLP exporter: {err}, falling back to stdout only");
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
            return None;
        }
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            cfg.service_name.to_string(),
        )]))
        .build();

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(provider.tracer(cfg.service_name.to_string()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    tracing::info!(endpoint, service = cfg.service_name, "OTLP tracing enabled");
    Some(provider)
}
