//! Data models for Tagweld.

mod asset;
mod detection;
mod edge;
mod state;

pub use asset::{AssetKey, CandidateAsset, DiagramNode, ScopeKey};
pub use detection::{BoundingBox, Detection, DetectionMode};
pub use edge::{annotation_external_id, AnnotationEdge, EdgeStatus, EdgeTag};
pub use state::{AnnotationState, AnnotationStatus, JobId};
