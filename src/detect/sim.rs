//! Simulated detection service.
//!
//! Runs detection in process against seeded page text. Used by tests
//! and by local experiments where no detection service is reachable.
//! Matching is deterministic: the confidence ladder reflects how much
//! normalization it took to land the match.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::models::{AssetKey, BoundingBox, JobId};
use crate::text;
use crate::text::patterns::compile_pattern;

use super::{
    DetectError, DetectPayload, DetectRequest, DetectResult, DetectionService, DiagramWindow,
    JobState, JobStatus, RawDetection, SearchTarget,
};

const CONFIDENCE_EXACT: f64 = 0.95;
const CONFIDENCE_FOLDED: f64 = 0.90;
const CONFIDENCE_STRIPPED: f64 = 0.70;
const CONFIDENCE_ZEROLESS: f64 = 0.55;

/// A piece of text somewhere on a seeded diagram page.
#[derive(Debug, Clone)]
struct PageToken {
    page: u32,
    text: String,
    region: BoundingBox,
}

struct SimJob {
    status: JobStatus,
    results: Vec<RawDetection>,
}

#[derive(Default)]
struct SimInner {
    /// Seeded tokens per diagram ref.
    pages: HashMap<String, Vec<PageToken>>,
    jobs: HashMap<String, SimJob>,
    /// Diagrams whose next submission fails with this message.
    fail_next: HashMap<String, String>,
    /// When set, every submission is refused outright.
    refuse: Option<String>,
    /// When set, submissions queue instead of completing immediately.
    hold: bool,
}

#[derive(Default)]
pub struct SimDetectionService {
    inner: Mutex<SimInner>,
}

impl SimDetectionService {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Seeding and fault-injection controls. Exercised by tests; the
/// binary only ever drives the [`DetectionService`] surface.
#[allow(dead_code)]
impl SimDetectionService {
    /// Place text on a diagram page for later jobs to find.
    pub async fn seed_text(&self, diagram_ref: &str, page: u32, text: &str, region: BoundingBox) {
        let mut inner = self.inner.lock().await;
        inner
            .pages
            .entry(diagram_ref.to_string())
            .or_default()
            .push(PageToken {
                page,
                text: text.to_string(),
                region,
            });
    }

    /// Make the next job covering this diagram fail.
    pub async fn fail_next_submit(&self, diagram_ref: &str, message: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .fail_next
            .insert(diagram_ref.to_string(), message.to_string());
    }

    /// Refuse every submission, as an unreachable backend would.
    pub async fn refuse_submissions(&self, message: &str) {
        let mut inner = self.inner.lock().await;
        inner.refuse = Some(message.to_string());
    }

    /// Leave new jobs queued instead of completing them on submit.
    pub async fn hold_submissions(&self) {
        let mut inner = self.inner.lock().await;
        inner.hold = true;
    }

    /// Complete every job still queued.
    pub async fn release_jobs(&self) {
        let mut inner = self.inner.lock().await;
        inner.hold = false;
        for job in inner.jobs.values_mut() {
            if !job.status.state.is_settled() {
                job.status.state = JobState::Completed;
            }
        }
    }

    /// Shift every job's submission time into the past.
    pub async fn age_jobs(&self, seconds: i64) {
        let mut inner = self.inner.lock().await;
        for job in inner.jobs.values_mut() {
            job.status.submitted_at -= chrono::Duration::seconds(seconds);
        }
    }
}

impl SimDetectionService {
    fn match_standard(
        diagram_ref: &str,
        token: &PageToken,
        targets: &[SearchTarget],
    ) -> Option<RawDetection> {
        let raw = token.text.trim();
        let folded = text::normalize(raw);
        let stripped = text::strip_special(&folded);
        let zeroless = text::strip_leading_zeros(&stripped);

        for target in targets {
            for term in &target.terms {
                let confidence = if raw == term.trim() {
                    CONFIDENCE_EXACT
                } else if folded == text::normalize(term) {
                    CONFIDENCE_FOLDED
                } else if stripped == text::strip_special(&text::normalize(term)) {
                    CONFIDENCE_STRIPPED
                } else if zeroless
                    == text::strip_leading_zeros(&text::strip_special(&text::normalize(term)))
                {
                    CONFIDENCE_ZEROLESS
                } else {
                    continue;
                };
                return Some(RawDetection {
                    diagram_ref: diagram_ref.to_string(),
                    text: token.text.clone(),
                    page: token.page,
                    region: token.region,
                    confidence: Some(confidence),
                    target: Some(target.asset.clone()),
                });
            }
        }
        None
    }

    fn match_pattern(
        diagram_ref: &str,
        token: &PageToken,
        compiled: &[regex::Regex],
    ) -> Option<RawDetection> {
        let candidate = token.text.trim();
        if compiled.iter().any(|re| re.is_match(candidate)) {
            Some(RawDetection {
                diagram_ref: diagram_ref.to_string(),
                text: token.text.clone(),
                page: token.page,
                region: token.region,
                confidence: None,
                target: None,
            })
        } else {
            None
        }
    }

    fn run_item(
        inner: &SimInner,
        item: &DiagramWindow,
        payload: &DetectPayload,
        compiled: &[regex::Regex],
    ) -> Vec<RawDetection> {
        let tokens = match inner.pages.get(&item.diagram_ref) {
            Some(tokens) => tokens,
            None => return Vec::new(),
        };
        tokens
            .iter()
            .filter(|t| item.pages.contains(t.page))
            .filter_map(|t| match payload {
                DetectPayload::Standard { targets } => {
                    Self::match_standard(&item.diagram_ref, t, targets)
                }
                DetectPayload::Pattern { .. } => {
                    Self::match_pattern(&item.diagram_ref, t, compiled)
                }
            })
            .collect()
    }
}

#[async_trait]
impl DetectionService for SimDetectionService {
    async fn submit(&self, request: DetectRequest) -> DetectResult<JobId> {
        let mut inner = self.inner.lock().await;
        if let Some(message) = &inner.refuse {
            return Err(DetectError::Connection(message.clone()));
        }
        let job_id = JobId(format!("sim-{}", Uuid::new_v4()));

        // One poisoned diagram fails the whole batched job, like a
        // backend crash would.
        let injected = request
            .items
            .iter()
            .find_map(|item| inner.fail_next.remove(&item.diagram_ref));
        if let Some(message) = injected {
            inner.jobs.insert(
                job_id.as_str().to_string(),
                SimJob {
                    status: JobStatus {
                        job_id: job_id.clone(),
                        state: JobState::Failed { message },
                        submitted_at: Utc::now(),
                    },
                    results: Vec::new(),
                },
            );
            return Ok(job_id);
        }

        let compiled: Vec<regex::Regex> = match &request.payload {
            DetectPayload::Pattern { patterns } => patterns
                .iter()
                .filter_map(|p| match compile_pattern(p) {
                    Ok(re) => Some(re),
                    Err(err) => {
                        warn!("skipping pattern '{}': {}", p, err);
                        None
                    }
                })
                .collect(),
            DetectPayload::Standard { .. } => Vec::new(),
        };

        let results: Vec<RawDetection> = request
            .items
            .iter()
            .flat_map(|item| Self::run_item(&inner, item, &request.payload, &compiled))
            .collect();

        let state = if inner.hold {
            JobState::Queued
        } else {
            JobState::Completed
        };
        inner.jobs.insert(
            job_id.as_str().to_string(),
            SimJob {
                status: JobStatus {
                    job_id: job_id.clone(),
                    state,
                    submitted_at: Utc::now(),
                },
                results,
            },
        );
        Ok(job_id)
    }

    async fn job_status(&self, job_id: &JobId) -> DetectResult<JobStatus> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(job_id.as_str())
            .map(|j| j.status.clone())
            .ok_or_else(|| DetectError::JobNotFound(job_id.as_str().to_string()))
    }

    async fn job_results(&self, job_id: &JobId) -> DetectResult<Vec<RawDetection>> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(job_id.as_str())
            .map(|j| j.results.clone())
            .ok_or_else(|| DetectError::JobNotFound(job_id.as_str().to_string()))
    }

    async fn cancel(&self, job_id: &JobId) -> DetectResult<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.remove(job_id.as_str());
        Ok(())
    }

    async fn ping(&self) -> DetectResult<()> {
        Ok(())
    }
}
