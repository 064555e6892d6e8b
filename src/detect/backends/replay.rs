//! Replays detections computed offline.
//!
//! Input is JSON lines, one object per frame that has detections:
//!
//! ```text
//! {"frame": 3, "detections": [{"class": "car", "confidence": 0.91, "bbox": {"x": 10, "y": 20, "w": 40, "h": 30}}]}
//! ```
//!
//! Frames are matched on `Frame::seq`. Frames without a line yield nothing.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{retain_allowed, Detection};
use crate::error::CountResult;
use crate::frame::Frame;

#[derive(Deserialize)]
struct ReplayLine {
    frame: u64,
    #[serde(default)]
    detections: Vec<Detection>,
}

pub struct ReplayBackend {
    by_frame: HashMap<u64, Vec<Detection>>,
    min_confidence: f32,
}

impl ReplayBackend {
    pub fn open(path: &Path, min_confidence: f32) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read detections {}: {}", path.display(), e))?;
        let backend = Self::from_jsonl(&raw, min_confidence)?;
        log::info!(
            "ReplayBackend: {} frames with detections from {}",
            backend.by_frame.len(),
            path.display()
        );
        Ok(backend)
    }

    pub fn from_jsonl(raw: &str, min_confidence: f32) -> Result<Self> {
        let mut by_frame: HashMap<u64, Vec<Detection>> = HashMap::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ReplayLine = serde_json::from_str(line)
                .map_err(|e| anyhow!("detections line {}: {}", lineno + 1, e))?;
            by_frame
                .entry(parsed.frame)
                .or_default()
                .extend(parsed.detections);
        }
        Ok(Self {
            by_frame,
            min_confidence,
        })
    }
}

impl DetectorBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect(
        &mut self,
        frame: &Frame,
        allowed_classes: &HashSet<String>,
    ) -> CountResult<Vec<Detection>> {
        let mut detections = self.by_frame.remove(&frame.seq).unwrap_or_default();
        retain_allowed(&mut detections, allowed_classes, self.min_confidence);
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_by_frame_sequence() {
        let raw = r#"
{"frame": 2, "detections": [{"class": "car", "confidence": 0.9, "bbox": {"x": 0, "y": 0, "w": 10, "h": 10}}]}
{"frame": 2, "detections": [{"class": "person", "confidence": 0.9, "bbox": {"x": 5, "y": 5, "w": 2, "h": 6}}]}
{"frame": 3, "detections": [{"class": "bus", "confidence": 0.3, "bbox": {"x": 0, "y": 0, "w": 10, "h": 10}}]}
"#;
        let mut backend = ReplayBackend::from_jsonl(raw, 0.5).unwrap();
        let allowed: HashSet<String> = ["car", "bus"].iter().map(|s| s.to_string()).collect();

        let f1 = Frame::blank(4, 4, 1);
        let f2 = Frame::blank(4, 4, 2);
        let f3 = Frame::blank(4, 4, 3);
        assert!(backend.detect(&f1, &allowed).unwrap().is_empty());
        let dets = backend.detect(&f2, &allowed).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class, "car");
        assert!(backend.detect(&f3, &allowed).unwrap().is_empty());
    }

    #[test]
    fn malformed_line_is_reported() {
        let err = ReplayBackend::from_jsonl("{\"frame\": 1}\nnope\n", 0.5)
            .err()
            .unwrap();
        assert!(err.to_string().contains("line 2"));
    }
}
