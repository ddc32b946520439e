//! Phase services for the annotation pipeline.
//!
//! Launch, finalize and promote are separated from UI concerns: each
//! service emits progress events over a channel and folds everything
//! that happened into a [`RunSummary`]. Errors never escape a phase
//! boundary; a run that cannot even start comes back as a `Failure`
//! summary rather than an `Err`.

pub mod finalize;
pub mod launch;
pub mod promote;

pub use finalize::{FinalizeEvent, FinalizeOptions, FinalizeService};
pub use launch::{LaunchEvent, LaunchOptions, LaunchService};
pub use promote::{PromoteEvent, PromoteOptions, PromoteService};

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Pipeline phase a summary belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Launch,
    Finalize,
    Promote,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Launch => "launch",
            Phase::Finalize => "finalize",
            Phase::Promote => "promote",
        }
    }
}

/// How a run went overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failure => "failure",
        }
    }
}

/// Outcome of one phase invocation. Consumers render this as a table
/// or as JSON; every field is part of the audit surface.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub phase: Phase,
    pub pipeline: String,
    pub status: RunStatus,
    /// Host the run executed on, for multi-worker deployments.
    pub worker: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Primary unit of work: diagrams launched, states settled, edges
    /// examined, depending on the phase.
    pub processed: usize,
    pub counts: BTreeMap<String, usize>,
    pub failures: Vec<String>,
    pub message: String,
}

impl RunSummary {
    pub fn new(phase: Phase, pipeline: &str) -> Self {
        Self {
            phase,
            pipeline: pipeline.to_string(),
            status: RunStatus::Success,
            worker: worker_identity(),
            started_at: Utc::now(),
            elapsed_ms: 0,
            processed: 0,
            counts: BTreeMap::new(),
            failures: Vec::new(),
            message: String::new(),
        }
    }

    pub fn count(&mut self, name: &str, value: usize) {
        self.counts.insert(name.to_string(), value);
    }

    pub fn add_failure(&mut self, message: impl Into<String>) {
        self.failures.push(message.into());
    }

    /// Close the summary: stamp elapsed time, derive the overall
    /// status from what was recorded, set the human-readable message.
    pub fn finish(mut self, started: Instant, message: impl Into<String>) -> Self {
        self.elapsed_ms = started.elapsed().as_millis() as u64;
        self.status = if self.failures.is_empty() {
            RunStatus::Success
        } else if self.processed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failure
        };
        self.message = message.into();
        self
    }

    /// A run that could not start at all.
    pub fn failed(phase: Phase, pipeline: &str, started: Instant, error: impl Into<String>) -> Self {
        let error = error.into();
        let mut summary = Self::new(phase, pipeline);
        summary.add_failure(error.clone());
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        summary.status = RunStatus::Failure;
        summary.message = error;
        summary
    }
}

/// Identity reported in summaries so runs from different hosts can be
/// told apart.
pub fn worker_identity() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_status_derivation() {
        let started = Instant::now();
        let mut summary = RunSummary::new(Phase::Launch, "pipe-std");
        summary.processed = 4;
        let done = summary.clone().finish(started, "launched 4");
        assert_eq!(done.status, RunStatus::Success);

        summary.add_failure("group site-b failed");
        let done = summary.clone().finish(started, "launched 4, 1 failure");
        assert_eq!(done.status, RunStatus::Partial);

        summary.processed = 0;
        let done = summary.finish(started, "nothing launched");
        assert_eq!(done.status, RunStatus::Failure);
    }

    #[test]
    fn test_failed_summary_carries_error() {
        let summary = RunSummary::failed(
            Phase::Finalize,
            "pipe-std",
            Instant::now(),
            "store unreachable",
        );
        assert_eq!(summary.status, RunStatus::Failure);
        assert_eq!(summary.failures, vec!["store unreachable".to_string()]);
        assert_eq!(summary.message, "store unreachable");
    }
}
