//! Event publication with broker confirmation.
//!
//! Turns a validated CloudEvent into a persistent AMQP message, publishes it
//! on the supervisor's current channel, and waits for the broker's ack or
//! nack. The outcome carries the HTTP status the submitter should see:
//!
//! | Outcome                         | Status | Dispatch time |
//! |---------------------------------|--------|---------------|
//! | serialization failed            | 400    | none          |
//! | no channel / publish rejected   | 500    | none          |
//! | broker nacked                   | 500    | recorded      |
//! | broker acked                    | 202    | recorded      |
//!
//! Nothing is retried here; the supervisor recovers the channel and the
//! submitter retries the request.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use opentelemetry::trace::SpanContext;
use tracing::{debug, Instrument};

use crate::broker::{BrokerError, Confirmation, HeaderValue, OutboundMessage};
use crate::event::{AttributesReader, Event, ExtensionValue};
use crate::supervisor::Supervisor;

/// Content type of every published message body.
pub const MESSAGE_CONTENT_TYPE: &str = "application/json";

pub const TYPE_HEADER: &str = "type";
pub const SOURCE_HEADER: &str = "source";
pub const SUBJECT_HEADER: &str = "subject";
pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Headers every message carries before extensions are copied in.
pub const RESERVED_HEADERS: [&str; 5] = [
    TYPE_HEADER,
    SOURCE_HEADER,
    SUBJECT_HEADER,
    TRACEPARENT_HEADER,
    TRACESTATE_HEADER,
];

/// Errors raised while publishing an event.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to marshal event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish message: {0}")]
    Publish(#[from] BrokerError),

    #[error("Failed to publish message: nacked")]
    Nacked,
}

/// Result of one publish attempt.
#[derive(Debug)]
pub struct PublishOutcome {
    pub status: StatusCode,
    /// Time from publish start to broker confirmation, if one arrived.
    pub dispatch_time: Option<Duration>,
    pub error: Option<PublishError>,
}

impl PublishOutcome {
    fn accepted(dispatch_time: Duration) -> Self {
        Self {
            status: StatusCode::ACCEPTED,
            dispatch_time: Some(dispatch_time),
            error: None,
        }
    }

    fn failed(status: StatusCode, error: PublishError) -> Self {
        Self {
            status,
            dispatch_time: None,
            error: Some(error),
        }
    }

    fn nacked(dispatch_time: Duration) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            dispatch_time: Some(dispatch_time),
            error: Some(PublishError::Nacked),
        }
    }
}

/// Publishes events to the supervised exchange.
#[derive(Clone)]
pub struct Publisher {
    supervisor: Arc<Supervisor>,
}

impl Publisher {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    /// Publish `event` and wait for the broker's confirmation.
    pub async fn publish(&self, event: Event, span: &SpanContext) -> PublishOutcome {
        let publish_span = tracing::info_span!("ingress.publish", event_type = %event.ty());
        self.publish_inner(event, span)
            .instrument(publish_span)
            .await
    }

    async fn publish_inner(&self, event: Event, span: &SpanContext) -> PublishOutcome {
        let message = match build_message(&event, span) {
            Ok(message) => message,
            Err(e) => return PublishOutcome::failed(StatusCode::BAD_REQUEST, e),
        };

        let exchange = &self.supervisor.endpoint().exchange;
        let start = Instant::now();

        let Some(channel) = self.supervisor.channel().await else {
            return PublishOutcome::failed(
                StatusCode::INTERNAL_SERVER_ERROR,
                BrokerError::ChannelClosed.into(),
            );
        };

        let confirm = match channel.publish(exchange, message).await {
            Ok(confirm) => confirm,
            Err(e) => return PublishOutcome::failed(StatusCode::INTERNAL_SERVER_ERROR, e.into()),
        };

        let confirmation = confirm.wait().await;
        let dispatch_time = start.elapsed();
        debug!(
            exchange = %exchange,
            ?confirmation,
            dispatch_ms = dispatch_time.as_secs_f64() * 1000.0,
            "Broker confirmation received"
        );

        match confirmation {
            Confirmation::Ack => PublishOutcome::accepted(dispatch_time),
            Confirmation::Nack => PublishOutcome::nacked(dispatch_time),
        }
    }
}

/// Serialize `event` and assemble its broker message.
///
/// Extensions are copied after the reserved headers, so an extension whose
/// name matches a reserved header replaces it.
pub fn build_message(event: &Event, span: &SpanContext) -> Result<OutboundMessage, PublishError> {
    let body = serde_json::to_vec(event)?;

    let (traceparent, tracestate) = trace_headers(span);
    let mut headers = BTreeMap::new();
    headers.insert(TYPE_HEADER.to_string(), HeaderValue::from(event.ty()));
    headers.insert(
        SOURCE_HEADER.to_string(),
        HeaderValue::from(event.source().to_string()),
    );
    headers.insert(
        SUBJECT_HEADER.to_string(),
        HeaderValue::from(event.subject().unwrap_or_default()),
    );
    headers.insert(TRACEPARENT_HEADER.to_string(), HeaderValue::from(traceparent));
    headers.insert(TRACESTATE_HEADER.to_string(), HeaderValue::from(tracestate));

    for (key, value) in event.iter_extensions() {
        if RESERVED_HEADERS.contains(&key) {
            debug!(header = key, "Extension attribute replaces reserved header");
        }
        headers.insert(key.to_string(), extension_header(value));
    }

    Ok(OutboundMessage {
        headers,
        content_type: MESSAGE_CONTENT_TYPE.to_string(),
        body,
        persistent: true,
    })
}

/// W3C `traceparent` and `tracestate` values for a span context.
///
/// An invalid (empty) context yields an all-zero traceparent.
pub fn trace_headers(span: &SpanContext) -> (String, String) {
    let traceparent = format!(
        "00-{:032x}-{:016x}-{:02x}",
        span.trace_id(),
        span.span_id(),
        span.trace_flags().to_u8()
    );
    (traceparent, span.trace_state().header())
}

fn extension_header(value: &ExtensionValue) -> HeaderValue {
    match value {
        ExtensionValue::String(s) => HeaderValue::String(s.clone()),
        ExtensionValue::Boolean(b) => HeaderValue::Bool(*b),
        ExtensionValue::Integer(i) => HeaderValue::Int(*i),
    }
}
