//! Zone map: named counting polygons plus mask regions.
//!
//! The zone document is JSON with two top-level mappings:
//!
//! ```json
//! { "areas": { "north": [[0,0],[10,0],[10,10]] }, "mask": { "0": [[...]] } }
//! ```
//!
//! Area order in the document is the tie-break order used by the crossing
//! state machine, so the document is parsed without re-sorting keys.
//!
//! The active `ZoneSet` is swapped as a whole (`Arc`) and only between frames.

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{CountError, CountResult};
use crate::Point;

/// Closed polygon with integer vertices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Polygon {
    points: Vec<Point>,
}

impl Polygon {
    pub fn new(points: Vec<Point>) -> CountResult<Self> {
        if points.len() < 3 {
            return Err(CountError::config(format!(
                "polygon needs at least 3 points, got {}",
                points.len()
            )));
        }
        Ok(Self { points })
    }

    /// Axis-aligned rectangle from two opposite corners.
    pub fn rect(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self {
            points: vec![
                Point::new(x0, y0),
                Point::new(x1, y0),
                Point::new(x1, y1),
                Point::new(x0, y1),
            ],
        }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Inclusive containment: vertices and edge points count as inside.
    pub fn contains(&self, p: Point) -> bool {
        let n = self.points.len();
        let (px, py) = (p.x as i64, p.y as i64);
        let mut inside = false;

        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            let (ax, ay, bx, by) = (a.x as i64, a.y as i64, b.x as i64, b.y as i64);

            let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
            if cross == 0
                && px >= ax.min(bx)
                && px <= ax.max(bx)
                && py >= ay.min(by)
                && py <= ay.max(by)
            {
                return true;
            }

            if (ay > py) != (by > py) {
                // Sign of (x_intersection - px) scaled by dy.
                let dy = by - ay;
                let num = (py - ay) * (bx - ax) - (px - ax) * dy;
                if (num > 0) == (dy > 0) {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Bounding box as (min_x, min_y, max_x, max_y).
    pub fn bounds(&self) -> (i32, i32, i32, i32) {
        let mut b = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
        for p in &self.points {
            b.0 = b.0.min(p.x);
            b.1 = b.1.min(p.y);
            b.2 = b.2.max(p.x);
            b.3 = b.3.max(p.y);
        }
        b
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Zone {
    pub name: String,
    pub polygon: Polygon,
}

/// One immutable generation of zone configuration.
#[derive(Clone, Debug, Default)]
pub struct ZoneSet {
    pub mask: Vec<Polygon>,
    zones: Vec<Zone>,
}

impl ZoneSet {
    pub fn new(mask: Vec<Polygon>, zones: Vec<Zone>) -> CountResult<Self> {
        for (i, zone) in zones.iter().enumerate() {
            validate_zone_name(&zone.name)?;
            if zones[..i].iter().any(|z| z.name == zone.name) {
                return Err(CountError::config(format!(
                    "duplicate zone name '{}'",
                    zone.name
                )));
            }
        }
        Ok(Self { mask, zones })
    }

    /// Zones in document order.
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    /// Parse a zone document.
    pub fn from_json(raw: &str) -> CountResult<Self> {
        let doc: ZoneDocument = serde_json::from_str(raw)
            .map_err(|e| CountError::config(format!("invalid zone document: {}", e)))?;

        let mask = doc
            .mask
            .0
            .into_iter()
            .map(|(_, pts)| Polygon::new(to_points(pts)))
            .collect::<CountResult<Vec<_>>>()?;
        let zones = doc
            .areas
            .0
            .into_iter()
            .map(|(name, pts)| {
                Ok(Zone {
                    polygon: Polygon::new(to_points(pts))?,
                    name,
                })
            })
            .collect::<CountResult<Vec<_>>>()?;
        Self::new(mask, zones)
    }

    pub fn load(path: &Path) -> CountResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CountError::config(format!("failed to read zone file {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }
}

/// Any non-blank name is accepted; the zone editor writes free-form labels.
pub fn validate_zone_name(name: &str) -> CountResult<()> {
    if name.trim().is_empty() {
        return Err(CountError::config("zone name must not be blank"));
    }
    Ok(())
}

fn to_points(raw: Vec<[i32; 2]>) -> Vec<Point> {
    raw.into_iter().map(|[x, y]| Point::new(x, y)).collect()
}

#[derive(Deserialize)]
struct ZoneDocument {
    areas: OrderedPolygons,
    #[serde(default)]
    mask: OrderedPolygons,
}

/// JSON object kept in document order.
#[derive(Default)]
struct OrderedPolygons(Vec<(String, Vec<[i32; 2]>)>);

impl<'de> Deserialize<'de> for OrderedPolygons {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = OrderedPolygons;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of name to a list of [x, y] points")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, pts)) = map.next_entry::<String, Vec<[i32; 2]>>()? {
                    out.push((name, pts));
                }
                Ok(OrderedPolygons(out))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

// ----------------------------------------------------------------------------
// Reload signalling
// ----------------------------------------------------------------------------

/// Shareable "zones changed" flag.
#[derive(Clone, Debug, Default)]
pub struct ReloadSignal(Arc<AtomicBool>);

impl ReloadSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Consume the flag.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Raises a `ReloadSignal` when the zone file's modification time moves.
pub struct ZoneFileWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ZoneFileWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_modified = modified(&path);
        Self {
            path,
            last_modified,
        }
    }

    pub fn poll(&mut self, signal: &ReloadSignal) {
        let current = modified(&self.path);
        if current.is_some() && current != self.last_modified {
            self.last_modified = current;
            signal.raise();
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ----------------------------------------------------------------------------
// ZoneMap
// ----------------------------------------------------------------------------

/// Holder of the active zone set.
pub struct ZoneMap {
    path: PathBuf,
    active: Arc<ZoneSet>,
    signal: ReloadSignal,
}

impl ZoneMap {
    /// Initial load. Errors here are fatal for the caller.
    pub fn open(path: impl Into<PathBuf>) -> CountResult<Self> {
        let path = path.into();
        let set = ZoneSet::load(&path)?;
        log::info!(
            "zones loaded from {}: {} areas, {} mask regions",
            path.display(),
            set.len(),
            set.mask.len()
        );
        Ok(Self {
            path,
            active: Arc::new(set),
            signal: ReloadSignal::new(),
        })
    }

    /// In-memory zone map (no backing file to reload from).
    pub fn fixed(set: ZoneSet) -> Self {
        Self {
            path: PathBuf::new(),
            active: Arc::new(set),
            signal: ReloadSignal::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn signal(&self) -> ReloadSignal {
        self.signal.clone()
    }

    /// Snapshot used for one frame.
    pub fn current(&self) -> Arc<ZoneSet> {
        self.active.clone()
    }

    /// Reload when signalled. Returns true when a new set was installed.
    ///
    /// A broken document keeps the previous set; the next signal retries.
    pub fn reload_if_signaled(&mut self) -> bool {
        if !self.signal.take() {
            return false;
        }
        if self.path.as_os_str().is_empty() {
            return false;
        }
        match ZoneSet::load(&self.path) {
            Ok(set) => {
                log::info!(
                    "zones reloaded: {} areas, {} mask regions",
                    set.len(),
                    set.mask.len()
                );
                self.active = Arc::new(set);
                true
            }
            Err(e) => {
                log::error!("zone reload failed, keeping previous zones: {}", e);
                false
            }
        }
    }
}
