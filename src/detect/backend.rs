use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::path::PathBuf;

use super::backends::{ReplayBackend, StubBackend};
use super::result::Detection;
use crate::error::CountResult;
use crate::frame::Frame;

/// Detector backend trait.
///
/// Model inference lives behind this boundary. The pipeline hands over the
/// masked frame and the class allowlist; only detections come back.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame, returning only allowlisted classes.
    fn detect(
        &mut self,
        frame: &Frame,
        allowed_classes: &HashSet<String>,
    ) -> CountResult<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> CountResult<()> {
        Ok(())
    }
}

/// Detector selection from configuration.
#[derive(Clone, Debug)]
pub struct DetectorSettings {
    /// `stub` or `replay`.
    pub backend: String,
    /// JSON-lines detections file for the replay backend.
    pub replay_path: Option<PathBuf>,
    pub confidence_threshold: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: "stub".to_string(),
            replay_path: None,
            confidence_threshold: 0.5,
        }
    }
}

pub fn build_backend(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    match settings.backend.as_str() {
        "stub" => Ok(Box::new(StubBackend::new())),
        "replay" => {
            let path = settings
                .replay_path
                .as_ref()
                .ok_or_else(|| anyhow!("replay detector requires a detections file"))?;
            Ok(Box::new(ReplayBackend::open(
                path,
                settings.confidence_threshold,
            )?))
        }
        other => Err(anyhow!("unknown detector backend '{}'", other)),
    }
}
