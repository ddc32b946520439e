use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::asset::AssetKey;
use crate::models::detection::{BoundingBox, Detection, DetectionMode};

/// Review status of an annotation edge.
///
/// The engine writes `Approved` and `Suggested`; `Rejected` comes from
/// promotion dead ends and from reviewers, and is never overwritten by
/// a later pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    Approved,
    Suggested,
    Rejected,
}

impl EdgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeStatus::Approved => "approved",
            EdgeStatus::Suggested => "suggested",
            EdgeStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(EdgeStatus::Approved),
            "suggested" => Some(EdgeStatus::Suggested),
            "rejected" => Some(EdgeStatus::Rejected),
            _ => None,
        }
    }

    /// Band a detection confidence into a status. Returns None when the
    /// confidence falls below the suggestion floor, which drops the
    /// detection entirely. Pattern detections carry no confidence and
    /// always land as suggestions.
    pub fn from_confidence(confidence: Option<f64>, approve: f64, suggest: f64) -> Option<Self> {
        match confidence {
            Some(c) if c >= approve => Some(EdgeStatus::Approved),
            Some(c) if c >= suggest => Some(EdgeStatus::Suggested),
            Some(_) => None,
            None => Some(EdgeStatus::Suggested),
        }
    }
}

/// Machine-written markers on an edge, recording what automation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTag {
    /// Promotion resolved this pattern match to exactly one asset.
    PromotedAuto,
    /// Promotion ran for this edge; it is never picked up again.
    PromoteAttempted,
    /// Promotion found more than one plausible asset; left on the
    /// review node for a reviewer to decide.
    AmbiguousMatch,
}

impl EdgeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeTag::PromotedAuto => "promoted_auto",
            EdgeTag::PromoteAttempted => "promote_attempted",
            EdgeTag::AmbiguousMatch => "ambiguous_match",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "promoted_auto" => Some(EdgeTag::PromotedAuto),
            "promote_attempted" => Some(EdgeTag::PromoteAttempted),
            "ambiguous_match" => Some(EdgeTag::AmbiguousMatch),
            _ => None,
        }
    }
}

/// A single annotation on a diagram page: a region of detected text,
/// linked to the asset it names.
///
/// Standard detections link straight to their resolved asset. Pattern
/// detections link to the configured review placeholder node until
/// promotion repoints them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationEdge {
    /// Deterministic identity in the graph store, derived from the
    /// diagram and the detection's stable hash so reruns upsert
    /// instead of duplicating.
    pub external_id: String,
    pub diagram_ref: String,
    pub target: AssetKey,
    pub status: EdgeStatus,
    pub tags: BTreeSet<EdgeTag>,
    pub confidence: Option<f64>,
    pub text: String,
    pub page: u32,
    pub region: BoundingBox,
    pub mode: DetectionMode,
    /// Pipeline that produced this edge.
    pub pipeline: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnnotationEdge {
    /// Build an edge from a banded detection. The caller supplies the
    /// target: the detection's resolved asset for standard mode, the
    /// review placeholder for pattern mode.
    pub fn from_detection(
        detection: &Detection,
        target: AssetKey,
        status: EdgeStatus,
        pipeline: &str,
    ) -> Self {
        let now = Utc::now();
        let stable_hash = detection.stable_hash();
        Self {
            external_id: annotation_external_id(&detection.diagram_ref, &stable_hash),
            diagram_ref: detection.diagram_ref.clone(),
            target,
            status,
            tags: BTreeSet::new(),
            confidence: detection.confidence,
            text: detection.text.trim().to_string(),
            page: detection.page,
            region: detection.region,
            mode: detection.mode,
            pipeline: pipeline.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_tag(&self, tag: EdgeTag) -> bool {
        self.tags.contains(&tag)
    }

    /// Whether promotion should pick this edge up: a suggestion still
    /// sitting on the review node that no promotion pass has touched.
    pub fn is_promotable(&self, review_node: &AssetKey) -> bool {
        self.status == EdgeStatus::Suggested
            && self.target == *review_node
            && !self.has_tag(EdgeTag::PromoteAttempted)
    }
}

/// Stable identity for an annotation in the graph store. The hash
/// prefix keeps ids short while still separating every callout on a
/// diagram.
pub fn annotation_external_id(diagram_ref: &str, stable_hash: &str) -> String {
    let prefix = &stable_hash[..stable_hash.len().min(16)];
    format!("ann:{diagram_ref}:{prefix}")
}
