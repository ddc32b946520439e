//! Detection service client layer.
//!
//! Text detection runs out of process: the engine submits jobs naming
//! a batch of diagrams, their page windows and what to look for, then
//! polls until the job settles and collects raw detections.
//! [`DetectionService`] is the seam; the HTTP backend talks to the real
//! service and the simulator backs tests with seeded page text.

pub mod http;
pub mod sim;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AssetKey, BoundingBox, JobId};

pub use http::HttpDetectionService;
pub use sim::SimDetectionService;

pub type DetectResult<T> = Result<T, DetectError>;

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("detection service connection error: {0}")]
    Connection(String),
    #[error("detection service API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
    #[error("failed to parse detection response: {0}")]
    Parse(String),
    #[error("unknown detection job {0}")]
    JobNotFound(String),
    #[error("invalid detection request: {0}")]
    InvalidRequest(String),
}

/// Inclusive 1-based page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, page: u32) -> bool {
        page >= self.start && page <= self.end
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl std::fmt::Display for PageRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// One asset the standard pass searches for, with every string that
/// counts as a hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTarget {
    pub asset: AssetKey,
    pub terms: Vec<String>,
}

/// What a job looks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DetectPayload {
    /// Exact search for known asset names and aliases.
    Standard { targets: Vec<SearchTarget> },
    /// Shape-template search; matches carry no target.
    Pattern { patterns: Vec<String> },
}

/// One diagram's slice of a batched job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagramWindow {
    pub diagram_ref: String,
    pub pages: PageRange,
}

impl DiagramWindow {
    pub fn new(diagram_ref: impl Into<String>, pages: PageRange) -> Self {
        Self {
            diagram_ref: diagram_ref.into(),
            pages,
        }
    }
}

/// A detection job covers several diagrams at once; every state in the
/// launch batch ends up tied to the same job id pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectRequest {
    pub items: Vec<DiagramWindow>,
    #[serde(flatten)]
    pub payload: DetectPayload,
}

/// Lifecycle of a detection job on the service side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed { message: String },
}

impl JobState {
    /// The job will not change anymore.
    pub fn is_settled(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed { .. })
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, JobState::Completed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    #[serde(flatten)]
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
}

/// A single hit reported by the detection service. The job context
/// supplies the mode; the diagram is named per hit because one job
/// spans a whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDetection {
    pub diagram_ref: String,
    pub text: String,
    pub page: u32,
    pub region: BoundingBox,
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Which search target matched, for standard jobs.
    #[serde(default)]
    pub target: Option<AssetKey>,
}

#[async_trait]
pub trait DetectionService: Send + Sync {
    /// Submit a job; returns immediately with its handle.
    async fn submit(&self, request: DetectRequest) -> DetectResult<JobId>;

    async fn job_status(&self, job_id: &JobId) -> DetectResult<JobStatus>;

    /// Raw detections of a completed job.
    async fn job_results(&self, job_id: &JobId) -> DetectResult<Vec<RawDetection>>;

    /// Best-effort cancellation; unknown jobs are not an error.
    async fn cancel(&self, job_id: &JobId) -> DetectResult<()>;

    async fn ping(&self) -> DetectResult<()>;
}
