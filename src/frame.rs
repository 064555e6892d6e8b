//! Frame container and frame-level operations.
//!
//! - `Frame`: RGB8 pixels plus the sequence number assigned at capture.
//! - Mask application: blacks out mask polygons before detection.
//! - Background snapshot: the first frame of a run is written as PNG so that
//!   zone-editing tooling has a reference image to draw on.

use anyhow::{anyhow, Result};
use std::path::Path;

use crate::zones::Polygon;
use crate::Point;

/// One decoded video frame, packed RGB8, row-major.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 1-based position in the source stream.
    pub seq: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, seq: u64) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "frame {}: expected {} bytes for {}x{} rgb, got {}",
                seq,
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            seq,
        })
    }

    /// All-black frame.
    pub fn blank(width: u32, height: u32, seq: u64) -> Self {
        Self {
            data: vec![0u8; width as usize * height as usize * 3],
            width,
            height,
            seq,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Copy of this frame with every mask polygon filled black.
    pub fn masked(&self, mask: &[Polygon]) -> Frame {
        let mut out = Frame {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            seq: self.seq,
        };
        for poly in mask {
            out.fill_polygon(poly, [0, 0, 0]);
        }
        out
    }

    fn fill_polygon(&mut self, poly: &Polygon, rgb: [u8; 3]) {
        if self.width == 0 || self.height == 0 {
            return;
        }
        let (min_x, min_y, max_x, max_y) = poly.bounds();
        let x0 = min_x.max(0);
        let y0 = min_y.max(0);
        let x1 = max_x.min(self.width as i32 - 1);
        let y1 = max_y.min(self.height as i32 - 1);

        for y in y0..=y1 {
            for x in x0..=x1 {
                if poly.contains(Point::new(x, y)) {
                    let idx = (y as usize * self.width as usize + x as usize) * 3;
                    self.data[idx..idx + 3].copy_from_slice(&rgb);
                }
            }
        }
    }

    /// Write the frame as a PNG image.
    pub fn write_png(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        image::save_buffer_with_format(
            path,
            &self.data,
            self.width,
            self.height,
            image::ExtendedColorType::Rgb8,
            image::ImageFormat::Png,
        )
        .map_err(|e| anyhow!("failed to write snapshot {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn white(width: u32, height: u32) -> Frame {
        Frame::new(vec![255u8; (width * height * 3) as usize], width, height, 1).unwrap()
    }

    fn pixel(frame: &Frame, x: usize, y: usize) -> [u8; 3] {
        let idx = (y * frame.width as usize + x) * 3;
        let p = frame.pixels();
        [p[idx], p[idx + 1], p[idx + 2]]
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        assert!(Frame::new(vec![0u8; 10], 4, 4, 1).is_err());
    }

    #[test]
    fn mask_blacks_out_interior_and_edges_only() {
        let frame = white(20, 20);
        let masked = frame.masked(&[Polygon::rect(2, 2, 5, 5)]);
        assert_eq!(pixel(&masked, 3, 3), [0, 0, 0]);
        assert_eq!(pixel(&masked, 5, 5), [0, 0, 0]);
        assert_eq!(pixel(&masked, 6, 6), [255, 255, 255]);
        // source frame untouched
        assert_eq!(pixel(&frame, 3, 3), [255, 255, 255]);
    }

    #[test]
    fn mask_outside_frame_is_clipped() {
        let frame = white(8, 8);
        let masked = frame.masked(&[Polygon::rect(-10, -10, 1, 1)]);
        assert_eq!(pixel(&masked, 0, 0), [0, 0, 0]);
        assert_eq!(pixel(&masked, 2, 2), [255, 255, 255]);
    }

    #[test]
    fn snapshot_is_written_as_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bg/canvas_bg.png");
        white(4, 3).write_png(&path).unwrap();
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (4, 3));
    }
}
