//! Ingress stats reporting.
//!
//! The handler reports two measurements per request:
//! - dispatch time, only when the broker confirmed (ack or nack)
//! - event count, always, tagged with the response code
//!
//! Implementations:
//! - `OtelStatsReporter`: OpenTelemetry counter and histogram (feature `otel`)
//! - `LogStatsReporter`: `tracing` debug events

#[cfg(feature = "otel")]
pub mod otel;

use std::time::Duration;

use http::StatusCode;
use tracing::debug;

#[cfg(feature = "otel")]
pub use otel::OtelStatsReporter;

/// Dimensions shared by both measurements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArgs {
    pub namespace: String,
    pub broker_name: String,
    pub event_type: String,
}

/// Sink for ingress measurements.
pub trait StatsReporter: Send + Sync {
    /// Record time from publish start to broker confirmation.
    fn report_dispatch_time(&self, args: &ReportArgs, status: StatusCode, elapsed: Duration);

    /// Count one handled event.
    fn report_event_count(&self, args: &ReportArgs, status: StatusCode);
}

/// `2xx`, `4xx`, `5xx`, ...
pub fn response_code_class(status: StatusCode) -> String {
    format!("{}xx", status.as_u16() / 100)
}

/// Writes measurements to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatsReporter;

impl StatsReporter for LogStatsReporter {
    fn report_dispatch_time(&self, args: &ReportArgs, status: StatusCode, elapsed: Duration) {
        debug!(
            namespace_name = %args.namespace,
            broker_name = %args.broker_name,
            event_type = %args.event_type,
            response_code = status.as_u16(),
            dispatch_ms = elapsed.as_secs_f64() * 1000.0,
            "Event dispatch time"
        );
    }

    fn report_event_count(&self, args: &ReportArgs, status: StatusCode) {
        debug!(
            namespace_name = %args.namespace,
            broker_name = %args.broker_name,
            event_type = %args.event_type,
            response_code = status.as_u16(),
            response_code_class = %response_code_class(status),
            "Event handled"
        );
    }
}
