//! Intersection counter
//!
//! Turns per-frame object detections into stable tracks and converts track
//! trajectories into "vehicle went from zone A to zone B" records, which are
//! buffered and flushed to durable storage in batches, with a local file
//! fallback when the durable store is unavailable.
//!
//! # Module Structure
//!
//! - `zones`: zone polygons, mask regions, reload signalling
//! - `frame`, `ingest`: frame container and frame sources
//! - `detect`, `track`: detector and tracker capability boundaries
//! - `crossing`: per-track zone entry/exit state machine
//! - `allocator`, `buffer`: vehicle id allocation and the pending event buffer
//! - `storage`, `fallback`, `gateway`: durable store, local fallback, flush protocol
//! - `pipeline`: frame loop driver
//! - Core types: Point, Rect, VehicleRecord, PositionPoint

use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

pub mod allocator;
pub mod buffer;
pub mod config;
pub mod crossing;
pub mod detect;
pub mod error;
pub mod fallback;
pub mod frame;
pub mod gateway;
pub mod ingest;
pub mod pipeline;
pub mod storage;
pub mod track;
pub mod zones;

pub use allocator::VehicleIdAllocator;
pub use buffer::{EventBuffer, FlushBatch};
pub use crossing::CrossingStateMachine;
pub use detect::{Detection, DetectorBackend, ReplayBackend, StubBackend};
pub use error::{CountError, CountResult};
pub use fallback::LocalFallback;
pub use frame::Frame;
pub use gateway::{FlushOutcome, FlushReport, Flusher, PersistenceGateway};
pub use ingest::{FrameSource, RawFileSource, SourceConfig, SyntheticSource};
pub use pipeline::{FrameOutcome, Pipeline, PipelineSettings, PipelineStats};
pub use storage::{InMemoryVehicleStore, OfflineStore, SharedStore, SqliteVehicleStore, VehicleStore};
pub use track::{IouTracker, IouTrackerConfig, TrackId, TrackSnapshot, Tracker};
pub use zones::{Polygon, ReloadSignal, Zone, ZoneFileWatcher, ZoneMap, ZoneSet};

/// Wall-clock format used for persisted timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub type VehicleId = i64;

// -------------------- Geometry --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned box: top-left corner plus size, in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// Integer midpoint of the box.
    pub fn centroid(&self) -> Point {
        let x2 = self.x + self.w;
        let y2 = self.y + self.h;
        Point::new((self.x + x2) / 2, (self.y + y2) / 2)
    }

    pub fn area(&self) -> i64 {
        self.w.max(0) as i64 * self.h.max(0) as i64
    }

    pub fn iou(&self, other: &Rect) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        let inter = Rect::new(x1, y1, x2 - x1, y2 - y1).area();
        if inter == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f32 / union as f32
    }
}

// -------------------- Records --------------------

/// One counted vehicle. Created once per counted track; never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub vehicle_id: VehicleId,
    pub class: String,
    pub origin: Option<String>,
    pub exit: Option<String>,
    pub timestamp: NaiveDateTime,
}

/// One recorded track position of a counted vehicle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionPoint {
    pub x: i32,
    pub y: i32,
    pub vehicle_id: VehicleId,
}

/// Local wall-clock time truncated to whole seconds.
pub fn now_local() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}
