//! Aggregate statistics over a finished run.
//!
//! Everything here is a pure function of the outcome list and the run
//! window, so summaries are reproducible from a saved report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::outcome::{RequestOutcome, TestRun};

/// Error rate above which a run is flagged
pub const ERROR_RATE_THRESHOLD: f64 = 0.05;

/// Stream completion rate below which a run is flagged
pub const STREAM_COMPLETION_THRESHOLD: f64 = 0.90;

/// Linearly interpolated percentile of an ascending slice.
///
/// `p` is in `[0, 100]` (clamped). Returns 0 for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let p = p.clamp(0.0, 100.0);
    let last = sorted.len() - 1;
    let k = last as f64 * (p / 100.0);
    let f = k.floor() as usize;
    let c = (f + 1).min(last);
    let d = k - f as f64;

    sorted[f] + d * (sorted[c] - sorted[f])
}

fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

/// Summary report of a load-test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub error_rate: f64,
    /// Histogram keyed by stringified status code ("0" = no response)
    pub status_code_counts: BTreeMap<String, u64>,
    /// TTFT percentiles in seconds, over requests that received a token
    pub ttft_p50: f64,
    pub ttft_p95: f64,
    pub ttft_p99: f64,
    /// End-to-end latency percentiles in seconds, over successful requests
    pub latency_p50: f64,
    pub latency_p95: f64,
    pub total_tokens: u64,
    pub tokens_per_sec: f64,
    pub requests_per_sec: f64,
    pub stream_completion_rate: f64,
    /// Seconds between run start and the end of the drain
    pub duration_actual: f64,
}

impl Summary {
    /// Build the summary for `outcomes` observed between `start` and `end`.
    pub fn from_outcomes(
        outcomes: &[RequestOutcome],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        let duration = (end - start)
            .num_microseconds()
            .map(|us| us as f64 / 1_000_000.0)
            .unwrap_or(0.0);

        let total = outcomes.len() as u64;
        let successful = outcomes.iter().filter(|o| o.is_success()).count() as u64;
        let failed = total - successful;
        let completed = outcomes.iter().filter(|o| o.stream_completed).count() as u64;
        let total_tokens: u64 = outcomes.iter().map(|o| o.tokens_received).sum();

        let mut status_code_counts = BTreeMap::new();
        for outcome in outcomes {
            *status_code_counts
                .entry(outcome.status_code.to_string())
                .or_insert(0) += 1;
        }

        let ttfts = sorted(
            outcomes
                .iter()
                .map(|o| o.time_to_first_token)
                .filter(|t| *t > 0.0)
                .collect(),
        );
        let latencies = sorted(
            outcomes
                .iter()
                .filter(|o| o.is_success())
                .map(|o| o.total_time)
                .collect(),
        );

        let ratio = |count: u64| {
            if total == 0 {
                0.0
            } else {
                count as f64 / total as f64
            }
        };
        let per_sec = |count: u64| {
            if duration > 0.0 {
                count as f64 / duration
            } else {
                0.0
            }
        };

        Self {
            total_requests: total,
            successful,
            failed,
            error_rate: ratio(failed),
            status_code_counts,
            ttft_p50: percentile(&ttfts, 50.0),
            ttft_p95: percentile(&ttfts, 95.0),
            ttft_p99: percentile(&ttfts, 99.0),
            latency_p50: percentile(&latencies, 50.0),
            latency_p95: percentile(&latencies, 95.0),
            total_tokens,
            tokens_per_sec: per_sec(total_tokens),
            requests_per_sec: per_sec(total),
            stream_completion_rate: ratio(completed),
            duration_actual: duration,
        }
    }

    /// Summary of a finished run
    pub fn from_run(run: &TestRun) -> Self {
        Self::from_outcomes(&run.outcomes, run.start_time, run.end_time)
    }

    /// Threshold breaches worth flagging. Advisory only; a flagged run is
    /// still a completed run.
    pub fn advisories(&self) -> Vec<Advisory> {
        let mut advisories = Vec::new();

        if self.error_rate > ERROR_RATE_THRESHOLD {
            advisories.push(Advisory::ErrorRateExceeded {
                rate: self.error_rate,
            });
        }
        if self.stream_completion_rate < STREAM_COMPLETION_THRESHOLD {
            advisories.push(Advisory::LowStreamCompletion {
                rate: self.stream_completion_rate,
            });
        }

        advisories
    }
}

/// Observation attached to a run whose quality falls outside the thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    ErrorRateExceeded { rate: f64 },
    LowStreamCompletion { rate: f64 },
}

impl std::fmt::Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Advisory::ErrorRateExceeded { rate } => write!(
                f,
                "Error rate {:.1}% exceeds {:.0}% threshold",
                rate * 100.0,
                ERROR_RATE_THRESHOLD * 100.0
            ),
            Advisory::LowStreamCompletion { rate } => write!(
                f,
                "Stream completion rate {:.1}% below {:.0}%",
                rate * 100.0,
                STREAM_COMPLETION_THRESHOLD * 100.0
            ),
        }
    }
}
