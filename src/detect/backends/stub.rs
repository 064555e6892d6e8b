use std::collections::HashSet;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::CountResult;
use crate::frame::Frame;

/// Stub backend. Sees nothing; useful for dry runs of the pipeline plumbing.
#[derive(Default)]
pub struct StubBackend;

impl StubBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(
        &mut self,
        _frame: &Frame,
        _allowed_classes: &HashSet<String>,
    ) -> CountResult<Vec<Detection>> {
        Ok(Vec::new())
    }
}
