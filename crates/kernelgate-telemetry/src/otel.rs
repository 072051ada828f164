//! OTel internals: tracing layer, W3C propagation, and sampling.

use std::collections::HashMap;

use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider, ShouldSample};
use tracing_opentelemetry::OpenTelemetryLayer;

/// Failure to set up OTel export.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(String),
    #[error("failed to create OTel runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Flushes and shuts down the tracer provider when dropped.
///
/// Hold it for the life of the process. When `otel_layer` is called outside
/// any Tokio runtime, the guard also owns the runtime the exporter lives on.
pub struct OtelGuard {
    provider: SdkTracerProvider,
    // Field order matters: the enter guard is released before the runtime.
    _entered: Option<tokio::runtime::EnterGuard<'static>>,
    _exporter_runtime: Option<&'static tokio::runtime::Runtime>,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(err) = self.provider.shutdown() {
            eprintln!("kernelgate: tracer shutdown failed: {err}");
        }
    }
}

type ExporterSetup = (
    SpanExporter,
    Option<&'static tokio::runtime::Runtime>,
    Option<tokio::runtime::EnterGuard<'static>>,
);

fn build_exporter() -> Result<SpanExporter, TelemetryError> {
    SpanExporter::builder()
        .with_tonic()
        .build()
        .map_err(|err| TelemetryError::Exporter(err.to_string()))
}

/// The tonic exporter needs a reactor. Blocking-API callers have none, so
/// one is created and entered for the rest of the process.
fn exporter_with_runtime() -> Result<ExporterSetup, TelemetryError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Ok((build_exporter()?, None, None));
    }
    let runtime: &'static tokio::runtime::Runtime = Box::leak(Box::new(
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("kernelgate-otel")
            .enable_all()
            .build()?,
    ));
    let entered = runtime.enter();
    let exporter = runtime.block_on(async { build_exporter() })?;
    Ok((exporter, Some(runtime), Some(entered)))
}

/// Build the OTLP tracing layer for `tracing_subscriber::registry()`.
pub fn otel_layer<S>(
    service_name: &str,
) -> Result<(OpenTelemetryLayer<S, SdkTracer>, OtelGuard), TelemetryError>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let (exporter, exporter_runtime, entered) = exporter_with_runtime()?;

    let provider = SdkTracerProvider::builder()
        .with_resource(Resource::builder().with_service_name(service_name.to_owned()).build())
        .with_sampler(KernelgateSampler)
        .with_batch_exporter(exporter)
        .build();
    global::set_tracer_provider(provider.clone());

    let layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("kernelgate"));
    let guard = OtelGuard {
        provider,
        _entered: entered,
        _exporter_runtime: exporter_runtime,
    };
    Ok((layer, guard))
}

// ============================================================================
// W3C Trace Context propagation
// ============================================================================

/// Inject the current span's trace context as W3C `traceparent` + `tracestate`.
pub(crate) fn inject_trace_context_impl() -> (String, String) {
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let cx = tracing::Span::current().context();
    let propagator = TraceContextPropagator::new();

    let mut carrier = HashMap::new();
    propagator.inject_context(&cx, &mut carrier);

    let traceparent = carrier.remove("traceparent").unwrap_or_default();
    let tracestate = carrier.remove("tracestate").unwrap_or_default();
    (traceparent, tracestate)
}

// ============================================================================
// KernelgateSampler: differentiated sampling by span category
// ============================================================================

/// Head sampler keyed on span name.
///
/// Spans under a sampled parent are always kept, and so are spans that
/// carry an error attribute. Everything else is sampled by trace id at the
/// rate of the first matching prefix in `RATES`, or `DEFAULT_RATE`.
#[derive(Debug, Clone)]
struct KernelgateSampler;

const RATES: &[(&str, f64)] = &[("session", 1.0), ("execute", 1.0), ("pool", 0.1), ("channel", 0.01)];
const DEFAULT_RATE: f64 = 0.1;

fn rate_for(name: &str) -> f64 {
    RATES
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map_or(DEFAULT_RATE, |&(_, rate)| rate)
}

fn marks_error(attributes: &[KeyValue]) -> bool {
    attributes.iter().any(|kv| match (kv.key.as_str(), kv.value.as_str().as_ref()) {
        ("otel.status_code", "ERROR") | ("error", "true") => true,
        _ => false,
    })
}

fn keep(trace_state: TraceState) -> SamplingResult {
    SamplingResult {
        decision: SamplingDecision::RecordAndSample,
        attributes: Vec::new(),
        trace_state,
    }
}

impl ShouldSample for KernelgateSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        let parent = parent_context.map(|cx| cx.span().span_context().clone());
        if let Some(parent) = parent.filter(|p| p.is_sampled()) {
            return keep(parent.trace_state().clone());
        }
        if marks_error(attributes) {
            return keep(TraceState::default());
        }
        Sampler::TraceIdRatioBased(rate_for(name))
            .should_sample(parent_context, trace_id, name, span_kind, attributes, links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_attribute_detection() {
        assert!(marks_error(&[KeyValue::new("otel.status_code", "ERROR")]));
        assert!(!marks_error(&[KeyValue::new("error", "false")]));
        assert!(!marks_error(&[]));
    }

    #[test]
    fn test_rates_by_prefix() {
        assert_eq!(rate_for("session.execute"), 1.0);
        assert_eq!(rate_for("execute.send"), 1.0);
        assert_eq!(rate_for("pool.acquire"), 0.1);
        assert_eq!(rate_for("channel.recv"), 0.01);
        assert_eq!(rate_for("retry"), 0.1);
    }

    #[test]
    fn test_error_spans_always_sampled() {
        let result = KernelgateSampler.should_sample(
            None,
            TraceId::from_bytes([7; 16]),
            "channel.recv",
            &SpanKind::Internal,
            &[KeyValue::new("error", "true")],
            &[],
        );
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
    }
}
