//! Annotation state tracking for diagrams moving through the pipeline.
//!
//! One `AnnotationState` exists per diagram under annotation. All mutation
//! goes through version-checked writes against the graph store, so the
//! `version` field here is the concurrency-control mechanism: a writer that
//! read version N may only commit a write expecting version N.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque handle to an asynchronous detection job owned by the external
/// detection service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a diagram's annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationStatus {
    /// Waiting for a launch pass.
    New,
    /// Waiting for another launch pass after a recoverable failure.
    /// Selected exactly like `New` but keeps its attempt count visible.
    Retry,
    /// Detection jobs submitted, awaiting completion.
    Processing,
    /// Claimed by a finalize worker.
    Finalizing,
    /// All pages committed. Terminal.
    Annotated,
    /// Unrecoverable error or attempt ceiling reached. Terminal.
    Failed,
}

impl AnnotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Retry => "retry",
            Self::Processing => "processing",
            Self::Finalizing => "finalizing",
            Self::Annotated => "annotated",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "retry" => Some(Self::Retry),
            "processing" => Some(Self::Processing),
            "finalizing" => Some(Self::Finalizing),
            "annotated" => Some(Self::Annotated),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states are retained for audit and never re-selected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Annotated | Self::Failed)
    }

    /// Whether a launch pass may pick this state up.
    pub fn is_launchable(&self) -> bool {
        matches!(self, Self::New | Self::Retry)
    }

    /// Whether a finalize worker may claim this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Processing | Self::Finalizing)
    }

    /// Legal transitions of the annotation lifecycle. Reset is handled
    /// separately because it is legal from any state.
    pub fn can_transition(self, to: AnnotationStatus) -> bool {
        use AnnotationStatus::*;
        matches!(
            (self, to),
            (New, Processing)
                | (Retry, Processing)
                | (Processing, Finalizing)
                | (Finalizing, Processing) // jobs pending, batch re-enqueued
                | (Finalizing, Annotated)
                | (Finalizing, New) // pages remain
                | (Finalizing, Retry) // job failed, attempts remain
                | (Finalizing, Failed)
        )
    }
}

/// Per-diagram annotation progress record.
///
/// Owned exclusively by the orchestration engine; persisted in the graph
/// store and mutated only through conditional batch writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationState {
    /// External id of the diagram node. Immutable.
    pub diagram_ref: String,
    /// Pipeline this state belongs to. Immutable.
    pub pipeline: String,
    pub status: AnnotationStatus,
    /// Incremented on every launch submission.
    pub attempt_count: u32,
    /// Progress cursor: pages committed so far for multi-page diagrams.
    pub annotated_page_count: u32,
    /// Handle of the standard (entity-list) detection job, if submitted.
    pub detect_job_id: Option<JobId>,
    /// Handle of the pattern-mode detection job, if submitted.
    pub pattern_job_id: Option<JobId>,
    /// Bumped on every reset; in-flight work from an older generation is
    /// rejected by the accompanying version bump.
    pub generation: u32,
    /// Optimistic-concurrency token. Assigned by the store; a write must
    /// carry the version it read.
    pub version: u64,
    /// Diagnostic message for `Failed` (and the last retry reason).
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnnotationState {
    /// Create a fresh state for a diagram entering the pipeline.
    pub fn new(diagram_ref: impl Into<String>, pipeline: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            diagram_ref: diagram_ref.into(),
            pipeline: pipeline.into(),
            status: AnnotationStatus::New,
            attempt_count: 0,
            annotated_page_count: 0,
            detect_job_id: None,
            pattern_job_id: None,
            generation: 0,
            version: 0,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Launch submitted both jobs for this diagram.
    pub fn mark_processing(&mut self, detect_job: JobId, pattern_job: JobId) {
        debug_assert!(self.status.can_transition(AnnotationStatus::Processing));
        self.status = AnnotationStatus::Processing;
        self.attempt_count += 1;
        self.detect_job_id = Some(detect_job);
        self.pattern_job_id = Some(pattern_job);
        self.touch();
    }

    /// A finalize worker claimed this state.
    pub fn mark_finalizing(&mut self) {
        debug_assert!(self.status.can_transition(AnnotationStatus::Finalizing));
        self.status = AnnotationStatus::Finalizing;
        self.touch();
    }

    /// Jobs were not complete yet; hand the state back for a later poll.
    pub fn mark_reenqueued(&mut self) {
        debug_assert!(self.status.can_transition(AnnotationStatus::Processing));
        self.status = AnnotationStatus::Processing;
        self.touch();
    }

    /// All pages of the diagram are committed.
    pub fn mark_annotated(&mut self, pages_committed: u32) {
        debug_assert!(self.status.can_transition(AnnotationStatus::Annotated));
        self.status = AnnotationStatus::Annotated;
        self.annotated_page_count = pages_committed;
        self.detect_job_id = None;
        self.pattern_job_id = None;
        self.message = None;
        self.touch();
    }

    /// Pages remain: advance the cursor and re-enter the launch queue.
    pub fn mark_pages_remaining(&mut self, pages_committed: u32) {
        debug_assert!(self.status.can_transition(AnnotationStatus::New));
        self.status = AnnotationStatus::New;
        self.annotated_page_count = pages_committed;
        self.detect_job_id = None;
        self.pattern_job_id = None;
        self.touch();
    }

    /// A recoverable failure: back to the launch queue, attempts preserved.
    pub fn mark_retry(&mut self, reason: impl Into<String>) {
        debug_assert!(self.status.can_transition(AnnotationStatus::Retry));
        self.status = AnnotationStatus::Retry;
        self.detect_job_id = None;
        self.pattern_job_id = None;
        self.message = Some(reason.into());
        self.touch();
    }

    /// Unrecoverable failure, or the attempt ceiling was exceeded.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = AnnotationStatus::Failed;
        self.detect_job_id = None;
        self.pattern_job_id = None;
        self.message = Some(reason.into());
        self.touch();
    }

    /// Explicit reset: a new generation, eligible for launch again.
    ///
    /// Clearing the job ids is what abandons in-flight detection jobs: once
    /// their id pair no longer matches any state, completion handling finds
    /// nothing to commit.
    pub fn reset(&mut self) {
        self.status = AnnotationStatus::New;
        self.attempt_count = 0;
        self.annotated_page_count = 0;
        self.detect_job_id = None;
        self.pattern_job_id = None;
        self.generation += 1;
        self.message = None;
        self.touch();
    }

    /// The `(detect, pattern)` job pair tying this state to its launch
    /// batch, if both jobs were submitted.
    pub fn job_pair(&self) -> Option<(&JobId, &JobId)> {
        match (&self.detect_job_id, &self.pattern_job_id) {
            (Some(d), Some(p)) => Some((d, p)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            AnnotationStatus::New,
            AnnotationStatus::Retry,
            AnnotationStatus::Processing,
            AnnotationStatus::Finalizing,
            AnnotationStatus::Annotated,
            AnnotationStatus::Failed,
        ] {
            assert_eq!(AnnotationStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(AnnotationStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_transition_table() {
        use AnnotationStatus::*;
        assert!(New.can_transition(Processing));
        assert!(Retry.can_transition(Processing));
        assert!(Processing.can_transition(Finalizing));
        assert!(Finalizing.can_transition(Annotated));
        assert!(Finalizing.can_transition(New));
        assert!(Finalizing.can_transition(Failed));

        // No shortcuts around the claim step.
        assert!(!New.can_transition(Finalizing));
        assert!(!Processing.can_transition(Annotated));
        assert!(!Annotated.can_transition(Processing));
    }

    #[test]
    fn test_launch_increments_attempts() {
        let mut state = AnnotationState::new("diagram-1", "pipe");
        assert!(state.status.is_launchable());

        state.mark_processing(JobId::from("j-1"), JobId::from("j-2"));
        assert_eq!(state.status, AnnotationStatus::Processing);
        assert_eq!(state.attempt_count, 1);
        assert_eq!(state.job_pair().unwrap().0.as_str(), "j-1");
    }

    #[test]
    fn test_pages_remaining_requeues() {
        let mut state = AnnotationState::new("diagram-1", "pipe");
        state.mark_processing(JobId::from("j-1"), JobId::from("j-2"));
        state.mark_finalizing();
        state.mark_pages_remaining(50);

        assert_eq!(state.status, AnnotationStatus::New);
        assert_eq!(state.annotated_page_count, 50);
        assert!(state.job_pair().is_none());
        assert_eq!(state.attempt_count, 1);
    }

    #[test]
    fn test_reset_starts_new_generation() {
        let mut state = AnnotationState::new("diagram-1", "pipe");
        state.mark_processing(JobId::from("j-1"), JobId::from("j-2"));
        state.mark_finalizing();
        state.mark_annotated(60);
        state.attempt_count = 3;

        state.reset();
        assert_eq!(state.status, AnnotationStatus::New);
        assert_eq!(state.attempt_count, 0);
        assert_eq!(state.annotated_page_count, 0);
        assert_eq!(state.generation, 1);
        assert!(state.detect_job_id.is_none());
        assert!(state.status.is_launchable());
    }
}
