//! Tracker capability boundary.
//!
//! A tracker turns per-frame detections into stable identities. The counting
//! core only reads the snapshots exposed after `update`; association logic
//! stays behind this trait.

mod iou;

pub use iou::{IouTracker, IouTrackerConfig};

use crate::detect::Detection;
use crate::error::CountResult;
use crate::Rect;

pub type TrackId = u64;

/// Read-only view of one track after an update.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub class: String,
    pub confirmed: bool,
    /// 0 when the track was matched in the latest update.
    pub frames_since_update: u32,
    pub bbox: Rect,
}

pub trait Tracker: Send {
    fn name(&self) -> &'static str;

    /// Advance track state by one processed frame.
    fn predict(&mut self);

    fn update(&mut self, detections: &[Detection]) -> CountResult<()>;

    /// Live tracks, ordered by id.
    fn tracks(&self) -> Vec<TrackSnapshot>;
}
