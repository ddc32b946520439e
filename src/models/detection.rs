use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::asset::AssetKey;
use crate::text;

/// How a piece of text was found on a diagram page.
///
/// Standard detections come from searching for known asset names and
/// aliases; pattern detections come from shape templates and carry no
/// target until promotion resolves one. When both modes find the same
/// text at the same spot, standard wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    Standard,
    Pattern,
}

impl DetectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMode::Standard => "standard",
            DetectionMode::Pattern => "pattern",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(DetectionMode::Standard),
            "pattern" => Some(DetectionMode::Pattern),
            _ => None,
        }
    }

    /// Lower ranks win when two detections collide on stable hash.
    pub fn precedence(&self) -> u8 {
        match self {
            DetectionMode::Standard => 0,
            DetectionMode::Pattern => 1,
        }
    }
}

/// Axis-aligned region on a diagram page, in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    /// Corners scaled by 1000 and rounded to integers. Detection
    /// services jitter coordinates between runs below this resolution,
    /// so hashing the scaled form keeps reruns stable.
    pub fn scaled(&self) -> [i64; 4] {
        [
            (self.x_min * 1000.0).round() as i64,
            (self.y_min * 1000.0).round() as i64,
            (self.x_max * 1000.0).round() as i64,
            (self.y_max * 1000.0).round() as i64,
        ]
    }
}

/// One occurrence of text on a diagram page, as reported by the
/// detection service and normalized into our vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub diagram_ref: String,
    pub text: String,
    pub page: u32,
    pub region: BoundingBox,
    /// Match confidence in [0, 1]. Pattern detections carry none.
    pub confidence: Option<f64>,
    /// Asset the detection service matched, when it searched by name.
    pub target: Option<AssetKey>,
    pub mode: DetectionMode,
}

impl Detection {
    /// Identity of this detection across runs and modes: a digest of
    /// the normalized text, the page number, and the rounded region.
    /// Two detections with equal hashes are the same physical callout.
    pub fn stable_hash(&self) -> String {
        let [x0, y0, x1, y1] = self.region.scaled();
        let payload = format!(
            "{}|{}|{}|{}|{}|{}",
            text::normalize(&self.text),
            self.page,
            x0,
            y0,
            x1,
            y1
        );
        let mut hasher = Sha256::new();
        hasher.update(payload.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(text: &str, page: u32, region: BoundingBox, mode: DetectionMode) -> Detection {
        Detection {
            diagram_ref: "diagrams/d-100".to_string(),
            text: text.to_string(),
            page,
            region,
            confidence: Some(0.9),
            target: None,
            mode,
        }
    }

    #[test]
    fn test_stable_hash_ignores_case_whitespace_and_jitter() {
        let a = detection(
            " p-1203a ",
            2,
            BoundingBox::new(10.0001, 5.0, 20.0, 8.0),
            DetectionMode::Standard,
        );
        let b = detection(
            "P-1203A",
            2,
            BoundingBox::new(10.0004, 5.0, 20.0, 8.0),
            DetectionMode::Pattern,
        );
        assert_eq!(a.stable_hash(), b.stable_hash());
    }

    #[test]
    fn test_stable_hash_separates_pages_and_regions() {
        let base = BoundingBox::new(10.0, 5.0, 20.0, 8.0);
        let a = detection("P-1203A", 2, base, DetectionMode::Standard);
        let b = detection("P-1203A", 3, base, DetectionMode::Standard);
        let c = detection(
            "P-1203A",
            2,
            BoundingBox::new(11.0, 5.0, 20.0, 8.0),
            DetectionMode::Standard,
        );
        assert_ne!(a.stable_hash(), b.stable_hash());
        assert_ne!(a.stable_hash(), c.stable_hash());
    }

    #[test]
    fn test_mode_roundtrip_and_precedence() {
        for mode in [DetectionMode::Standard, DetectionMode::Pattern] {
            assert_eq!(DetectionMode::from_str(mode.as_str()), Some(mode));
        }
        assert!(DetectionMode::Standard.precedence() < DetectionMode::Pattern.precedence());
    }
}
