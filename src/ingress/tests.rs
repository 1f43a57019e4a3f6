use std::time::Duration;

use axum::body::Body;
use http::Request;
use tower::ServiceExt;

use super::*;
use crate::broker::{BrokerEndpoint, MockBehavior, MockBroker};
use crate::event::STRUCTURED_CONTENT_TYPE;
use crate::supervisor::{ReconnectConfig, Supervisor};
use crate::test_utils::RecordingStatsReporter;

const EVENT_BODY: &str = r#"{
    "specversion": "1.0",
    "id": "evt-1",
    "type": "demo",
    "source": "test",
    "subject": "s1",
    "datacontenttype": "application/json",
    "data": {}
}"#;

struct Harness {
    broker: MockBroker,
    supervisor: Arc<Supervisor>,
    reporter: Arc<RecordingStatsReporter>,
    router: Router,
}

impl Harness {
    async fn new(behavior: MockBehavior) -> Self {
        let broker = MockBroker::with_behavior(behavior);
        let reconnect = ReconnectConfig {
            min_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            jitter: false,
        };
        let supervisor = Arc::new(
            Supervisor::start(
                BrokerEndpoint::new("amqp://mock", "test-exchange"),
                broker.clone(),
                reconnect,
            )
            .await,
        );
        let reporter = Arc::new(RecordingStatsReporter::new());
        let router = router(IngressState {
            publisher: Publisher::new(Arc::clone(&supervisor)),
            reporter: reporter.clone(),
            namespace: "ns".to_string(),
            broker_name: "default".to_string(),
        });

        Self {
            broker,
            supervisor,
            reporter,
            router,
        }
    }

    async fn send(&self, request: Request<Body>) -> StatusCode {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
            .status()
    }
}

fn post(path: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(http::header::CONTENT_TYPE, STRUCTURED_CONTENT_TYPE)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_get_is_method_not_allowed_without_publish() {
    let harness = Harness::new(MockBehavior::Ack).await;

    let request = Request::builder()
        .method(Method::GET)
        .uri("/")
        .body(Body::empty())
        .unwrap();

    assert_eq!(harness.send(request).await, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(harness.broker.published_count().await, 0);
    assert!(harness.reporter.count_reports().is_empty());

    harness.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_method_is_checked_before_path() {
    let harness = Harness::new(MockBehavior::Ack).await;

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/elsewhere")
        .body(Body::empty())
        .unwrap();

    assert_eq!(harness.send(request).await, StatusCode::METHOD_NOT_ALLOWED);

    harness.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_wrong_path_is_not_found() {
    let harness = Harness::new(MockBehavior::Ack).await;

    assert_eq!(
        harness.send(post("/events", EVENT_BODY)).await,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        harness.send(post("/?source=x", EVENT_BODY)).await,
        StatusCode::NOT_FOUND
    );
    assert_eq!(harness.broker.published_count().await, 0);

    harness.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_invalid_json_is_bad_request_without_publish() {
    let harness = Harness::new(MockBehavior::Ack).await;

    assert_eq!(
        harness.send(post("/", "{not json")).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(harness.broker.published_count().await, 0);
    assert!(harness.reporter.count_reports().is_empty());

    harness.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_invalid_event_is_bad_request() {
    let harness = Harness::new(MockBehavior::Ack).await;
    let body = r#"{"specversion": "1.0", "id": "", "type": "demo", "source": "test"}"#;

    assert_eq!(harness.send(post("/", body)).await, StatusCode::BAD_REQUEST);
    assert_eq!(harness.broker.published_count().await, 0);

    harness.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_acked_event_is_accepted_and_reported() {
    let harness = Harness::new(MockBehavior::Ack).await;

    assert_eq!(harness.send(post("/", EVENT_BODY)).await, StatusCode::ACCEPTED);
    assert_eq!(harness.broker.published_count().await, 1);

    let dispatch = harness.reporter.dispatch_reports();
    assert_eq!(dispatch.len(), 1);
    assert_eq!(dispatch[0].status, StatusCode::ACCEPTED);
    assert_eq!(dispatch[0].args.namespace, "ns");
    assert_eq!(dispatch[0].args.broker_name, "default");
    assert_eq!(dispatch[0].args.event_type, "demo");
    assert!(dispatch[0].elapsed > Duration::ZERO);

    let counts = harness.reporter.count_reports();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].status, StatusCode::ACCEPTED);

    harness.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_nacked_event_is_server_error_with_dispatch_time() {
    let harness = Harness::new(MockBehavior::Nack).await;

    assert_eq!(
        harness.send(post("/", EVENT_BODY)).await,
        StatusCode::INTERNAL_SERVER_ERROR
    );

    let dispatch = harness.reporter.dispatch_reports();
    assert_eq!(dispatch.len(), 1);
    assert_eq!(dispatch[0].status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        harness.reporter.count_reports()[0].status,
        StatusCode::INTERNAL_SERVER_ERROR
    );

    harness.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_binary_mode_event_is_accepted() {
    let harness = Harness::new(MockBehavior::Ack).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header("ce-specversion", "1.0")
        .header("ce-id", "evt-2")
        .header("ce-type", "demo")
        .header("ce-source", "test")
        .header("ce-subject", "s1")
        .header("ce-tenant", "acme")
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();

    assert_eq!(harness.send(request).await, StatusCode::ACCEPTED);

    let published = harness.broker.published().await;
    assert_eq!(
        published[0].1.headers["tenant"],
        crate::broker::HeaderValue::from("acme")
    );

    harness.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_inbound_traceparent_is_propagated() {
    let harness = Harness::new(MockBehavior::Ack).await;

    let mut request = post("/", EVENT_BODY);
    request.headers_mut().insert(
        "traceparent",
        http::HeaderValue::from_static("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
    );

    assert_eq!(harness.send(request).await, StatusCode::ACCEPTED);

    let published = harness.broker.published().await;
    let crate::broker::HeaderValue::String(traceparent) = &published[0].1.headers["traceparent"]
    else {
        panic!("traceparent should be a string header");
    };
    assert!(traceparent.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));

    harness.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_oversized_body_is_not_read_before_routing_checks() {
    let harness = Harness::new(MockBehavior::Ack).await;
    let oversized = "x".repeat(MAX_BODY_BYTES + 1);

    let request = Request::builder()
        .method(Method::GET)
        .uri("/")
        .body(Body::from(oversized.clone()))
        .unwrap();
    assert_eq!(harness.send(request).await, StatusCode::METHOD_NOT_ALLOWED);

    assert_eq!(
        harness.send(post("/events", &oversized)).await,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        harness.send(post("/", &oversized)).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(harness.broker.published_count().await, 0);

    harness.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_envelope_without_id_or_specversion_is_bad_request() {
    let harness = Harness::new(MockBehavior::Ack).await;
    let body = r#"{"type": "demo", "source": "test", "subject": "s1", "data": {}}"#;

    assert_eq!(harness.send(post("/", body)).await, StatusCode::BAD_REQUEST);
    assert_eq!(harness.broker.published_count().await, 0);
    assert!(harness.reporter.count_reports().is_empty());

    harness.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_v03_event_is_accepted_in_both_modes() {
    let harness = Harness::new(MockBehavior::Ack).await;
    let structured = EVENT_BODY.replace("\"1.0\"", "\"0.3\"");

    assert_eq!(
        harness.send(post("/", &structured)).await,
        StatusCode::ACCEPTED
    );

    let binary = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header("ce-specversion", "0.3")
        .header("ce-id", "evt-3")
        .header("ce-type", "demo")
        .header("ce-source", "test")
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    assert_eq!(harness.send(binary).await, StatusCode::ACCEPTED);
    assert_eq!(harness.broker.published_count().await, 2);

    harness.supervisor.shutdown().await;
}
