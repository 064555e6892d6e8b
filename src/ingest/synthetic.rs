use anyhow::Result;

use super::{FrameSource, SourceConfig};
use crate::frame::Frame;

/// Generates a slowly shifting gradient. Used with the replay detector and in
/// tests, where pixel content does not matter.
pub struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        log::info!("SyntheticSource: connected to {}", config.url);
        Self {
            config,
            frame_count: 0,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = self.config.width as usize * self.config.height as usize * 3;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 / 3 + self.frame_count) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(max) = self.config.max_frames {
            if self.frame_count >= max {
                return Ok(None);
            }
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        )
        .map(Some)
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.url)
    }
}
