//! Per-request outcome records and the completed test run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::RequestError;

/// Result of one attempted streaming request.
///
/// Produced once by the executor and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub request_id: u64,
    pub start_time: DateTime<Utc>,
    /// Seconds until the first non-empty token; 0 if none arrived
    #[serde(rename = "ttft")]
    pub time_to_first_token: f64,
    /// Seconds until the terminal outcome
    pub total_time: f64,
    pub tokens_received: u64,
    /// Initial HTTP status; 0 if no status was ever received
    pub status_code: u16,
    /// Empty on success
    pub error: String,
    pub stream_completed: bool,
    pub finish_reason: String,
    /// `data:` payloads skipped because they did not parse
    #[serde(default)]
    pub malformed_frames: u64,
}

impl RequestOutcome {
    /// Fresh outcome for a request that is about to be issued
    pub fn started(request_id: u64, start_time: DateTime<Utc>) -> Self {
        Self {
            request_id,
            start_time,
            time_to_first_token: 0.0,
            total_time: 0.0,
            tokens_received: 0,
            status_code: 0,
            error: String::new(),
            stream_completed: false,
            finish_reason: String::new(),
            malformed_frames: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }

    pub(crate) fn fail(&mut self, err: RequestError) {
        self.error = err.to_string();
    }
}

/// All outcomes of a finished run plus its wall-clock window.
#[derive(Debug, Clone)]
pub struct TestRun {
    /// Outcomes in arrival (completion) order
    pub outcomes: Vec<RequestOutcome>,
    pub start_time: DateTime<Utc>,
    /// `start_time` plus the monotonic elapsed time of the run
    pub end_time: DateTime<Utc>,
    pub requested_duration: Duration,
    pub concurrency: usize,
}

impl TestRun {
    /// Actual length of the run, including the drain phase
    pub fn elapsed(&self) -> Duration {
        (self.end_time - self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_started_outcome_defaults() {
        let now = Utc::now();
        let outcome = RequestOutcome::started(7, now);

        assert_eq!(outcome.request_id, 7);
        assert_eq!(outcome.start_time, now);
        assert_eq!(outcome.status_code, 0);
        assert_eq!(outcome.tokens_received, 0);
        assert!(outcome.is_success());
        assert!(!outcome.stream_completed);
    }

    #[test]
    fn test_fail_records_wire_string() {
        let mut outcome = RequestOutcome::started(0, Utc::now());
        outcome.fail(RequestError::Http(503));

        assert!(!outcome.is_success());
        assert_eq!(outcome.error, "HTTP 503");
    }

    #[test]
    fn test_outcome_serialization_field_names() {
        let outcome = RequestOutcome::started(3, Utc::now());
        let json = serde_json::to_value(&outcome).unwrap();

        for field in [
            "request_id",
            "start_time",
            "ttft",
            "total_time",
            "tokens_received",
            "status_code",
            "error",
            "stream_completed",
            "finish_reason",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
    }

    #[test]
    fn test_run_elapsed() {
        let start = Utc::now();
        let run = TestRun {
            outcomes: vec![],
            start_time: start,
            end_time: start + chrono::Duration::milliseconds(1500),
            requested_duration: Duration::from_secs(1),
            concurrency: 2,
        };

        assert_eq!(run.elapsed(), Duration::from_millis(1500));
    }
}
