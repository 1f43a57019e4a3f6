//! Test utilities.
//!
//! In-memory collaborators for exercising the ingress without a broker or a
//! metrics pipeline. The in-memory broker itself lives in `broker::mock`.

use std::sync::Mutex;
use std::time::Duration;

use http::StatusCode;

use crate::stats::{ReportArgs, StatsReporter};

/// One recorded dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub args: ReportArgs,
    pub status: StatusCode,
    pub elapsed: Duration,
}

/// One recorded event count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountReport {
    pub args: ReportArgs,
    pub status: StatusCode,
}

/// Stats reporter that keeps every report in memory.
#[derive(Debug, Default)]
pub struct RecordingStatsReporter {
    dispatch: Mutex<Vec<DispatchReport>>,
    counts: Mutex<Vec<CountReport>>,
}

impl RecordingStatsReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch_reports(&self) -> Vec<DispatchReport> {
        self.dispatch
            .lock()
            .map(|reports| reports.clone())
            .unwrap_or_default()
    }

    pub fn count_reports(&self) -> Vec<CountReport> {
        self.counts
            .lock()
            .map(|reports| reports.clone())
            .unwrap_or_default()
    }
}

impl StatsReporter for RecordingStatsReporter {
    fn report_dispatch_time(&self, args: &ReportArgs, status: StatusCode, elapsed: Duration) {
        if let Ok(mut reports) = self.dispatch.lock() {
            reports.push(DispatchReport {
                args: args.clone(),
                status,
                elapsed,
            });
        }
    }

    fn report_event_count(&self, args: &ReportArgs, status: StatusCode) {
        if let Ok(mut reports) = self.counts.lock() {
            reports.push(CountReport {
                args: args.clone(),
                status,
            });
        }
    }
}
