//! Local raw-video file source.
//!
//! Reads packed RGB24 frames of a fixed size back to back, the format produced
//! by `ffmpeg -i input.mp4 -s 1248x704 -f rawvideo -pix_fmt rgb24 out.rgb`.
//! A trailing partial frame is treated as end of stream.

use anyhow::{anyhow, Result};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};

use super::{FrameSource, SourceConfig};
use crate::frame::Frame;

pub struct RawFileSource {
    config: SourceConfig,
    reader: BufReader<File>,
    frame_count: u64,
    finished: bool,
}

impl RawFileSource {
    pub fn open(config: SourceConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(anyhow!("raw file source requires a path"));
        }
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("raw file source requires non-zero frame size"));
        }
        let file = File::open(&config.url)
            .map_err(|e| anyhow!("failed to open video file {}: {}", config.url, e))?;
        log::info!(
            "RawFileSource: opened {} ({}x{} rgb24)",
            config.url,
            config.width,
            config.height
        );
        Ok(Self {
            config,
            reader: BufReader::new(file),
            frame_count: 0,
            finished: false,
        })
    }

    fn frame_len(&self) -> usize {
        self.config.width as usize * self.config.height as usize * 3
    }
}

impl FrameSource for RawFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.finished {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.frame_len()];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                log::info!(
                    "RawFileSource: end of {} after {} frames",
                    self.config.url,
                    self.frame_count
                );
                self.finished = true;
                return Ok(None);
            }
            Err(e) => return Err(anyhow!("read error on {}: {}", self.config.url, e)),
        }
        self.frame_count += 1;
        Frame::new(buf, self.config.width, self.config.height, self.frame_count).map(Some)
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}
