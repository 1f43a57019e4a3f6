//! Request spans and W3C trace context for inbound events.

use std::str::FromStr;

use http::HeaderMap;
use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

const TRACEPARENT: &str = "traceparent";
const TRACESTATE: &str = "tracestate";

/// Create the span for one ingress request.
///
/// When the `otel` feature is enabled, the inbound W3C `traceparent` is
/// set as the span's parent so the publish is recorded in the caller's trace.
pub fn make_request_span<B>(request: &http::Request<B>) -> tracing::Span {
    let span = tracing::info_span!(
        "ingress.request",
        method = %request.method(),
        path = %request.uri().path(),
    );

    #[cfg(feature = "otel")]
    {
        extract_trace_context(request.headers(), &span);
    }

    span
}

/// Span context to propagate on the published message.
///
/// Prefers the active OpenTelemetry span. Without one (no exporter
/// installed, or `otel` disabled) the inbound `traceparent` is forwarded
/// as-is. Falls back to the empty context.
pub fn request_span_context(headers: &HeaderMap) -> SpanContext {
    #[cfg(feature = "otel")]
    {
        use opentelemetry::trace::TraceContextExt;
        use tracing_opentelemetry::OpenTelemetrySpanExt;

        let context = tracing::Span::current().context();
        let current = context.span().span_context().clone();
        if current.is_valid() {
            return current;
        }
    }

    inbound_span_context(headers).unwrap_or_else(SpanContext::empty_context)
}

/// Parse `traceparent` / `tracestate` request headers.
pub fn inbound_span_context(headers: &HeaderMap) -> Option<SpanContext> {
    let traceparent = headers.get(TRACEPARENT)?.to_str().ok()?;
    let mut parts = traceparent.trim().split('-');

    let version = parts.next()?;
    if version.len() != 2 || version.eq_ignore_ascii_case("ff") {
        return None;
    }
    let trace_id = parts.next().filter(|p| p.len() == 32)?;
    let span_id = parts.next().filter(|p| p.len() == 16)?;
    let flags = parts.next().filter(|p| p.len() == 2)?;
    if version == "00" && parts.next().is_some() {
        return None;
    }

    let trace_id = TraceId::from_hex(trace_id).ok()?;
    let span_id = SpanId::from_hex(span_id).ok()?;
    let flags = u8::from_str_radix(flags, 16).ok()?;

    let trace_state = headers
        .get(TRACESTATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| TraceState::from_str(v).ok())
        .unwrap_or_default();

    let context = SpanContext::new(
        trace_id,
        span_id,
        TraceFlags::new(flags),
        true,
        trace_state,
    );
    context.is_valid().then_some(context)
}

/// Extract W3C trace context from HTTP headers and set as parent on the span.
#[cfg(feature = "otel")]
fn extract_trace_context(headers: &HeaderMap, span: &tracing::Span) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let parent_cx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers))
    });
    span.set_parent(parent_cx);
}

/// Adapter to extract OTel context from HTTP headers.
#[cfg(feature = "otel")]
struct HeaderExtractor<'a>(&'a HeaderMap);

#[cfg(feature = "otel")]
impl opentelemetry::propagation::Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}
