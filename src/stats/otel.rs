//! OpenTelemetry-backed stats reporter.
//!
//! Instruments are created lazily on the global meter, so they bind to
//! whatever meter provider bootstrap installed (or the no-op provider).
//! Names are dot-separated; the collector's Prometheus exporter converts
//! them to underscores.

use std::sync::LazyLock;
use std::time::Duration;

use http::StatusCode;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};
use uuid::Uuid;

use super::{response_code_class, ReportArgs, StatsReporter};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("rabbitmq-ingress"));

/// Events handled, by response code.
pub static EVENT_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("broker.ingress.event.count")
        .with_description("Number of events received by a broker ingress")
        .build()
});

/// Time from publish start to broker confirmation.
pub static DISPATCH_LATENCY: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("broker.ingress.event.dispatch.latency")
        .with_description("Time spent dispatching an event to the exchange")
        .with_unit("ms")
        .build()
});

/// Reports ingress measurements through OpenTelemetry instruments.
#[derive(Debug, Clone)]
pub struct OtelStatsReporter {
    container_name: String,
    unique_name: String,
}

impl OtelStatsReporter {
    /// `unique_name` is `<pod_name>-<random uuid>` so restarts of the same
    /// pod report as distinct instances.
    pub fn new(container_name: impl Into<String>, pod_name: &str) -> Self {
        Self {
            container_name: container_name.into(),
            unique_name: format!("{}-{}", pod_name, Uuid::new_v4()),
        }
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn attributes(&self, args: &ReportArgs, status: StatusCode) -> Vec<KeyValue> {
        vec![
            namespace_attr(&args.namespace),
            broker_name_attr(&args.broker_name),
            event_type_attr(&args.event_type),
            KeyValue::new("response_code", i64::from(status.as_u16())),
            KeyValue::new("response_code_class", response_code_class(status)),
            KeyValue::new("container_name", self.container_name.clone()),
            KeyValue::new("unique_name", self.unique_name.clone()),
        ]
    }
}

impl StatsReporter for OtelStatsReporter {
    fn report_dispatch_time(&self, args: &ReportArgs, status: StatusCode, elapsed: Duration) {
        DISPATCH_LATENCY.record(
            elapsed.as_secs_f64() * 1000.0,
            &self.attributes(args, status),
        );
    }

    fn report_event_count(&self, args: &ReportArgs, status: StatusCode) {
        EVENT_COUNT.add(1, &self.attributes(args, status));
    }
}

// ============================================================================
// Labels
// ============================================================================

pub fn namespace_attr(namespace: &str) -> KeyValue {
    KeyValue::new("namespace_name", namespace.to_string())
}

pub fn broker_name_attr(broker_name: &str) -> KeyValue {
    KeyValue::new("broker_name", broker_name.to_string())
}

pub fn event_type_attr(event_type: &str) -> KeyValue {
    KeyValue::new("event_type", event_type.to_string())
}
