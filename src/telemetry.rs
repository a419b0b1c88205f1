//! Log and trace integration. `tracing`/`tracing-subscriber` replace the Go
//! source's `github.com/no-mole/neptune/logger` package; every module here
//! logs structured `{component, event, ...}` fields through it rather than
//! printf-style messages, matching the `other_examples` startup-module
//! idiom (`init_logging`) this is grounded on.
//!
//! OpenTelemetry OTLP export is feature-gated behind `telemetry` — plain
//! `tracing-subscriber` JSON output is the default, no exporter required.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Installs the process-wide `tracing` subscriber. Call once at startup,
/// before any plugin's `init`.
///
/// Honors `RUST_LOG`; falls back to `info` for this crate and `warn`
/// elsewhere.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meshcore=debug"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true);

    // The OTLP layer is built against a bare `Registry` and attached first,
    // before the filter/fmt layers compose on top of it — attaching it
    // last would require it to type-check against whatever `Layered<...>`
    // type those produce, which `build_otel_layer`'s fixed return type
    // can't name.
    #[cfg(feature = "telemetry")]
    {
        if let Some(otel_layer) = build_otel_layer() {
            Registry::default()
                .with(otel_layer)
                .with(filter)
                .with(fmt_layer)
                .init();
            return;
        }
    }

    Registry::default().with(filter).with(fmt_layer).init();
}

#[cfg(feature = "telemetry")]
fn build_otel_layer() -> Option<tracing_opentelemetry::OpenTelemetryLayer<Registry, opentelemetry::sdk::trace::Tracer>> {
    use opentelemetry::sdk::trace as sdktrace;
    use opentelemetry_otlp::WithExportConfig;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(sdktrace::config())
        .install_batch(opentelemetry::runtime::Tokio)
        .ok()?;

    Some(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// The active span's trace id as a hex string, for inclusion in error
/// responses or log correlation. Empty when no span is active or the
/// `telemetry` feature is off.
pub fn current_trace_id() -> String {
    #[cfg(feature = "telemetry")]
    {
        use opentelemetry::trace::TraceContextExt;
        use tracing_opentelemetry::OpenTelemetrySpanExt;
        let span = tracing::Span::current();
        let context = span.context();
        let trace_id = context.span().span_context().trace_id();
        return format!("{trace_id:032x}");
    }
    #[cfg(not(feature = "telemetry"))]
    {
        String::new()
    }
}

/// Flushes any buffered spans. Call during graceful shutdown.
pub fn shutdown() {
    #[cfg(feature = "telemetry")]
    opentelemetry::global::shutdown_tracer_provider();
}
