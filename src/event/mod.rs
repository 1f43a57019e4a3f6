//! Inbound CloudEvents decoding and validation.
//!
//! Requests arrive in one of the CloudEvents HTTP binding modes:
//! - structured: `Content-Type: application/cloudevents+json`, envelope in the body
//! - binary: attributes in `ce-*` headers, data in the body
//!
//! Binary mode is folded into the structured JSON envelope and deserialized
//! through the same path, so both modes produce an identical [`Event`] and
//! accept the same spec versions (1.0 and 0.3).

use base64::Engine;
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use serde_json::{Map, Value};

pub use cloudevents::event::ExtensionValue;
pub use cloudevents::{AttributesReader, Event};

/// Content type of a structured-mode event.
pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";
/// Content type of a batch of structured events.
pub const BATCH_CONTENT_TYPE: &str = "application/cloudevents-batch+json";
/// Prefix of binary-mode attribute headers.
const BINARY_HEADER_PREFIX: &str = "ce-";
const SPEC_VERSION_V10: &str = "1.0";
const SPEC_VERSION_V03: &str = "0.3";

/// Errors raised while turning a request into an event.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Failed to decode event: {0}")]
    Decode(String),

    #[error("Invalid event: {0}")]
    Validation(String),
}

/// Decode a CloudEvent from request headers and body.
pub fn decode(headers: &HeaderMap, body: &[u8]) -> Result<Event, EventError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .map(|v| {
            v.to_str()
                .map(str::to_string)
                .map_err(|_| EventError::Decode("content-type is not valid ASCII".to_string()))
        })
        .transpose()?;
    let media_type = content_type.as_deref().map(media_type);

    match media_type.as_deref() {
        Some(STRUCTURED_CONTENT_TYPE) => decode_structured(body),
        Some(BATCH_CONTENT_TYPE) => Err(EventError::Decode(
            "batched events are not supported".to_string(),
        )),
        _ if headers.contains_key("ce-specversion") => {
            decode_binary(headers, content_type.as_deref(), body)
        }
        _ => Err(EventError::Decode(
            "unknown event encoding: expected structured or binary CloudEvent".to_string(),
        )),
    }
}

fn decode_structured(body: &[u8]) -> Result<Event, EventError> {
    serde_json::from_slice(body).map_err(|e| EventError::Decode(e.to_string()))
}

fn decode_binary(
    headers: &HeaderMap,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<Event, EventError> {
    let mut envelope = Map::new();

    for (name, value) in headers {
        let Some(attribute) = name.as_str().strip_prefix(BINARY_HEADER_PREFIX) else {
            continue;
        };
        let value = value.to_str().map_err(|_| {
            EventError::Decode(format!("header {} is not valid ASCII", name.as_str()))
        })?;
        envelope.insert(attribute.to_string(), Value::String(value.to_string()));
    }

    let v03 = match envelope.get("specversion").and_then(Value::as_str) {
        Some(SPEC_VERSION_V10) => false,
        Some(SPEC_VERSION_V03) => true,
        Some(other) => {
            return Err(EventError::Decode(format!(
                "unsupported spec version {}",
                other
            )))
        }
        None => return Err(EventError::Decode("missing ce-specversion".to_string())),
    };

    if let Some(content_type) = content_type {
        envelope.insert(
            "datacontenttype".to_string(),
            Value::String(content_type.to_string()),
        );
    }

    if !body.is_empty() {
        if content_type.map(is_json).unwrap_or(false) {
            let data: Value = serde_json::from_slice(body)
                .map_err(|e| EventError::Decode(format!("invalid JSON data: {}", e)))?;
            envelope.insert("data".to_string(), data);
        } else {
            let encoded = Value::String(base64::engine::general_purpose::STANDARD.encode(body));
            if v03 {
                envelope.insert("data".to_string(), encoded);
                envelope.insert(
                    "datacontentencoding".to_string(),
                    Value::String("base64".to_string()),
                );
            } else {
                envelope.insert("data_base64".to_string(), encoded);
            }
        }
    }

    serde_json::from_value(Value::Object(envelope)).map_err(|e| EventError::Decode(e.to_string()))
}

/// Check the decoded event against the CloudEvents attribute rules.
pub fn validate(event: &Event) -> Result<(), EventError> {
    let mut problems = Vec::new();

    if event.id().is_empty() {
        problems.push("id: MUST be a non-empty string".to_string());
    }
    if event.ty().is_empty() {
        problems.push("type: MUST be a non-empty string".to_string());
    }
    if event.source().as_str().is_empty() {
        problems.push("source: REQUIRED".to_string());
    }
    if event.subject() == Some("") {
        problems.push("subject: if present, MUST be a non-empty string".to_string());
    }
    if event.datacontenttype() == Some("") {
        problems.push("datacontenttype: if present, MUST be a non-empty string".to_string());
    }
    for (name, _) in event.iter_extensions() {
        if !is_valid_extension_name(name) {
            problems.push(format!(
                "{}: extension names MUST be lowercase letters or digits",
                name
            ));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(EventError::Validation(problems.join("; ")))
    }
}

fn is_valid_extension_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Media type without parameters, lowercased.
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_json(content_type: &str) -> bool {
    let media = media_type(content_type);
    media == "application/json" || media == "text/json" || media.ends_with("+json")
}
