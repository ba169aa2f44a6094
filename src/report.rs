//! Report rendering and persistence.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossterm::style::Stylize;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::metrics::{Advisory, Summary};
use crate::outcome::{RequestOutcome, TestRun};

/// Complete report of a run: summary plus every per-request record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metrics: Summary,
    pub advisories: Vec<Advisory>,
    pub run: RunInfo,
    pub requests: Vec<RequestOutcome>,
}

/// Shape of the run that produced the report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub requested_duration_secs: f64,
    pub concurrency: usize,
}

impl Report {
    /// Build the report for a finished run
    pub fn from_run(run: TestRun) -> Self {
        let metrics = Summary::from_run(&run);
        let advisories = metrics.advisories();

        Self {
            metrics,
            advisories,
            run: RunInfo {
                start_time: run.start_time,
                end_time: run.end_time,
                requested_duration_secs: run.requested_duration.as_secs_f64(),
                concurrency: run.concurrency,
            },
            requests: run.outcomes,
        }
    }
}

// ==================================================================================================
// Console Summary
// ==================================================================================================

const RULE: &str = "============================================";

/// Render the console summary (ANSI-coloured)
pub fn render_summary(summary: &Summary) -> String {
    let mut out = String::new();

    let _ = writeln!(out);
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "  Streaming Load Test Results");
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out);
    let _ = writeln!(out, "  Duration:              {:.1}s", summary.duration_actual);
    let _ = writeln!(out, "  Total requests:        {}", summary.total_requests);
    let _ = writeln!(
        out,
        "  {}:            {}",
        "Successful".green(),
        summary.successful
    );
    let _ = writeln!(out, "  {}:                {}", "Failed".red(), summary.failed);
    let _ = writeln!(
        out,
        "  Error rate:            {:.1}%",
        summary.error_rate * 100.0
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "  Stream completion:     {:.1}%",
        summary.stream_completion_rate * 100.0
    );
    let _ = writeln!(out, "  Tokens/sec:            {:.1}", summary.tokens_per_sec);
    let _ = writeln!(out, "  Requests/sec:          {:.2}", summary.requests_per_sec);
    let _ = writeln!(
        out,
        "  TTFT p50:              {:.1}ms",
        summary.ttft_p50 * 1000.0
    );
    let _ = writeln!(
        out,
        "  TTFT p95:              {:.1}ms",
        summary.ttft_p95 * 1000.0
    );
    let _ = writeln!(
        out,
        "  Latency p50:           {:.1}ms",
        summary.latency_p50 * 1000.0
    );
    let _ = writeln!(out);

    if !summary.status_code_counts.is_empty() {
        let _ = writeln!(out, "  Status codes:");
        for (code, count) in &summary.status_code_counts {
            let _ = writeln!(out, "    {}: {}", code, count);
        }
        let _ = writeln!(out);
    }

    for advisory in summary.advisories() {
        let _ = writeln!(out, "  {}", format!("[WARN] {}", advisory).red());
    }

    let _ = writeln!(out, "{}", RULE);
    out
}

/// Print the console summary to stdout
pub fn print_summary(summary: &Summary) {
    println!("{}", render_summary(summary));
}

// ==================================================================================================
// Atomic Report Sink
// ==================================================================================================

/// Removes the temporary file on drop unless the write was committed.
struct TempFileGuard {
    path: PathBuf,
    committed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write the report to `path` atomically.
///
/// The JSON is written in full to `<path>.tmp`, synced, then renamed over
/// `path`. On any failure the temporary is removed and an existing file at
/// `path` is left untouched.
pub fn write_report_atomic(path: &Path, report: &Report) -> Result<()> {
    let tmp = temp_path_for(path);
    let guard = TempFileGuard::new(tmp.clone());

    let file = File::create(&tmp)
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    let mut writer = BufWriter::new(file);

    serde_json::to_writer_pretty(&mut writer, report).context("Failed to serialize report")?;
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    writer
        .get_ref()
        .sync_all()
        .with_context(|| format!("Failed to sync {}", tmp.display()))?;
    drop(writer);

    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move report into place at {}", path.display()))?;
    guard.commit();

    tracing::info!("Results written to: {}", path.display());
    Ok(())
}
