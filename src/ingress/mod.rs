//! HTTP ingress.
//!
//! One endpoint, `POST /`, accepting a CloudEvent in structured or binary
//! mode. Every request is handled by a single fallback handler so the
//! method check runs before the path check on every route:
//!
//! 1. method other than POST → 405
//! 2. request URI other than `/` (including any query) → 404
//! 3. unreadable or oversized body, or undecodable event → 400
//! 4. invalid event → 400
//! 5. publish, respond with the publisher's status
//!
//! The body is only read once the request passed the method and path checks.
//! Response bodies are always empty.

pub mod trace;

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::Router;
use http::{Method, StatusCode};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::event::{self, AttributesReader};
use crate::publish::Publisher;
use crate::stats::{ReportArgs, StatsReporter};

/// The single path events are accepted on.
pub const INGRESS_PATH: &str = "/";

/// Largest request body read into memory.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Shared state for the ingress handler.
#[derive(Clone)]
pub struct IngressState {
    pub publisher: Publisher,
    pub reporter: Arc<dyn StatsReporter>,
    /// Namespace of the broker, for stats dimensions.
    pub namespace: String,
    pub broker_name: String,
}

/// Build the axum router (separated for testing).
pub fn router(state: IngressState) -> Router {
    Router::new()
        .fallback(handle)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::make_request_span::<axum::body::Body>),
        )
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "Ingress listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn handle(State(state): State<IngressState>, request: Request) -> StatusCode {
    let (parts, body) = request.into_parts();

    if parts.method != Method::POST {
        warn!(method = %parts.method, "Invalid HTTP method");
        return StatusCode::METHOD_NOT_ALLOWED;
    }

    if parts.uri.path() != INGRESS_PATH || parts.uri.query().is_some() {
        warn!(uri = %parts.uri, "Unexpected request URI");
        return StatusCode::NOT_FOUND;
    }

    let headers = parts.headers;
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return StatusCode::BAD_REQUEST;
        }
    };

    let event = match event::decode(&headers, &body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Failed to extract event from request");
            return StatusCode::BAD_REQUEST;
        }
    };

    if let Err(e) = event::validate(&event) {
        warn!(error = %e, event_id = %event.id(), "Rejecting invalid event");
        return StatusCode::BAD_REQUEST;
    }

    let args = ReportArgs {
        namespace: state.namespace.clone(),
        broker_name: state.broker_name.clone(),
        event_type: event.ty().to_string(),
    };
    let span = trace::request_span_context(&headers);

    let outcome = state.publisher.publish(event, &span).await;

    if let Some(dispatch_time) = outcome.dispatch_time {
        state
            .reporter
            .report_dispatch_time(&args, outcome.status, dispatch_time);
    }
    state.reporter.report_event_count(&args, outcome.status);

    if let Some(e) = &outcome.error {
        error!(
            error = %e,
            status = outcome.status.as_u16(),
            event_type = %args.event_type,
            "Failed to publish event"
        );
    }

    outcome.status
}

#[cfg(test)]
mod tests;
