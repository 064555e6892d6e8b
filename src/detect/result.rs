use serde::Deserialize;
use std::collections::HashSet;

use crate::Rect;

/// One detected object in pixel coordinates.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f32,
    pub bbox: Rect,
}

/// Drop detections outside the class allowlist or below `min_confidence`.
///
/// Class names compare case-insensitively.
pub fn retain_allowed(
    detections: &mut Vec<Detection>,
    allowed_classes: &HashSet<String>,
    min_confidence: f32,
) {
    detections.retain(|d| {
        d.confidence >= min_confidence && allowed_classes.contains(&d.class.to_lowercase())
    });
}
