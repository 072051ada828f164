//! OpenTelemetry integration for kernelgate.
//!
//! Provides the OTel tracing layer, W3C Trace Context injection so a
//! gateway-side tracer can correlate with the client's `session.execute`
//! span, and a sampler with differentiated rates by span category.
//!
//! # Activation
//!
//! Everything here is a no-op unless the crate is built with the
//! `telemetry` feature. With it, export activates when standard OTel
//! environment variables are set:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 kernelgate exec '2+2'
//!
//! OTEL_SERVICE_NAME=kernelgate \
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://jaeger:4317 \
//! kernelgate exec '2+2'
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to explicitly disable even when the endpoint is set.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, TelemetryError, otel_layer};

/// Check whether OTel export should be enabled.
///
/// Returns `true` when built with `telemetry` and the env indicates export:
/// - `OTEL_SDK_DISABLED` is NOT set to `"true"`
/// - AND at least one of:
///   - `OTEL_EXPORTER_OTLP_ENDPOINT` is set
///   - `OTEL_TRACES_EXPORTER` is set (and not `"none"`)
pub fn otel_enabled() -> bool {
    if !cfg!(feature = "telemetry") {
        return false;
    }
    enabled_by(|key| std::env::var(key).ok())
}

fn enabled_by(var: impl Fn(&str) -> Option<String>) -> bool {
    if var("OTEL_SDK_DISABLED").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        return false;
    }
    if var("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
        return true;
    }
    var("OTEL_TRACES_EXPORTER").is_some_and(|exporter| !exporter.eq_ignore_ascii_case("none"))
}

/// W3C Trace Context of the current tracing span.
///
/// Returns `(traceparent, tracestate)`; both are empty when there is no
/// sampled span or the crate was built without `telemetry`.
pub fn inject_trace_context() -> (String, String) {
    #[cfg(feature = "telemetry")]
    {
        otel::inject_trace_context_impl()
    }
    #[cfg(not(feature = "telemetry"))]
    {
        (String::new(), String::new())
    }
}
