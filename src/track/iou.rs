use std::cmp::Ordering;

use super::{TrackId, TrackSnapshot, Tracker};
use crate::detect::Detection;
use crate::error::CountResult;
use crate::Rect;

#[derive(Clone, Debug)]
pub struct IouTrackerConfig {
    /// Minimum IoU for a detection to continue a track.
    pub iou_threshold: f32,
    /// Consecutive hits before a track is confirmed.
    pub confirm_hits: u32,
    /// Missed frames before a confirmed track is dropped.
    pub max_age: u32,
}

impl Default for IouTrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            confirm_hits: 3,
            max_age: 30,
        }
    }
}

#[derive(Clone, Debug)]
struct IouTrack {
    id: TrackId,
    class: String,
    bbox: Rect,
    hits: u32,
    frames_since_update: u32,
    confirmed: bool,
}

/// Greedy IoU association tracker.
///
/// Tentative tracks are dropped on their first miss; confirmed tracks survive
/// up to `max_age` missed frames. Ids are never reused.
pub struct IouTracker {
    config: IouTrackerConfig,
    tracks: Vec<IouTrack>,
    next_id: TrackId,
}

impl IouTracker {
    pub fn new(config: IouTrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(IouTrackerConfig::default())
    }
}

impl Tracker for IouTracker {
    fn name(&self) -> &'static str {
        "iou"
    }

    fn predict(&mut self) {
        for track in &mut self.tracks {
            track.frames_since_update = track.frames_since_update.saturating_add(1);
        }
    }

    fn update(&mut self, detections: &[Detection]) -> CountResult<()> {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.config.iou_threshold {
                    pairs.push((iou, ti, di));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];
        for (_, ti, di) in pairs {
            if track_matched[ti] || det_matched[di] {
                continue;
            }
            track_matched[ti] = true;
            det_matched[di] = true;

            let track = &mut self.tracks[ti];
            let det = &detections[di];
            track.bbox = det.bbox;
            track.class = det.class.clone();
            track.hits += 1;
            track.frames_since_update = 0;
            if track.hits >= self.config.confirm_hits {
                track.confirmed = true;
            }
        }

        let max_age = self.config.max_age;
        let mut idx = 0;
        self.tracks.retain(|track| {
            let matched = track_matched[idx];
            idx += 1;
            matched || (track.confirmed && track.frames_since_update <= max_age)
        });

        for (di, det) in detections.iter().enumerate() {
            if det_matched[di] {
                continue;
            }
            self.tracks.push(IouTrack {
                id: self.next_id,
                class: det.class.clone(),
                bbox: det.bbox,
                hits: 1,
                frames_since_update: 0,
                confirmed: self.config.confirm_hits <= 1,
            });
            self.next_id += 1;
        }
        Ok(())
    }

    fn tracks(&self) -> Vec<TrackSnapshot> {
        self.tracks
            .iter()
            .map(|t| TrackSnapshot {
                id: t.id,
                class: t.class.clone(),
                confirmed: t.confirmed,
                frames_since_update: t.frames_since_update,
                bbox: t.bbox,
            })
            .collect()
    }
}
