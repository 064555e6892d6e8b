//! Frame ingestion sources.
//!
//! - Raw RGB24 video files (`ffmpeg -f rawvideo -pix_fmt rgb24` output)
//! - Synthetic source (`stub://`) for tests and dry runs
//!
//! Decoding of compressed streams happens outside this crate. A source yields
//! `Ok(None)` at end of stream.

use anyhow::{anyhow, Result};

pub mod file;
pub mod synthetic;

pub use file::RawFileSource;
pub use synthetic::SyntheticSource;

use crate::frame::Frame;

/// Something that produces frames in capture order.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Frames produced so far.
    fn frames_captured(&self) -> u64;

    fn describe(&self) -> String;
}

/// Source settings shared by every backend.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `stub://<name>` or a local file path.
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Frame limit for synthetic sources (`None` = endless).
    pub max_frames: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://intersection".to_string(),
            width: 1248,
            height: 704,
            max_frames: None,
        }
    }
}

/// Pick a source implementation from the configured URL.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())));
    }
    if config.url.contains("://") {
        return Err(anyhow!(
            "unsupported source '{}': only stub:// and local rgb24 files are supported",
            config.url
        ));
    }
    Ok(Box::new(RawFileSource::open(config.clone())?))
}
