//! Zone crossing state machine.
//!
//! Each track moves through `Uncounted(origin = None)` →
//! `Uncounted(origin = Z)` → `Counted`. Counting is terminal: once a track has
//! produced its `VehicleRecord` no further zone tests run for it and its
//! outcome never changes.
//!
//! With no zones configured a track is counted on its first confirmed,
//! non-stale observation with null origin and exit, even if it picked up an
//! origin under an earlier zone set.

use chrono::NaiveDateTime;
use std::collections::{HashMap, VecDeque};

use crate::track::{TrackId, TrackSnapshot};
use crate::zones::ZoneSet;
use crate::{Point, PositionPoint, VehicleId, VehicleRecord};

/// Capacity of the per-track overlay trace.
pub const OVERLAY_TRACE_LEN: usize = 10;

/// Tracks updated longer ago than this many frames are ignored.
pub const MAX_STALE_FRAMES: u32 = 1;

/// Core-owned state attached to one tracker identity.
#[derive(Clone, Debug, Default)]
pub struct TrackCrossing {
    pub origin: Option<String>,
    pub exit: Option<String>,
    pub vehicle_id: Option<VehicleId>,
    overlay: VecDeque<Point>,
    trace: Vec<Point>,
}

impl TrackCrossing {
    pub fn is_counted(&self) -> bool {
        self.vehicle_id.is_some()
    }

    /// Recent distinct positions, oldest first.
    pub fn overlay(&self) -> &VecDeque<Point> {
        &self.overlay
    }

    /// Every recorded position of the track.
    pub fn trace(&self) -> &[Point] {
        &self.trace
    }

    fn record_position(&mut self, p: Point) {
        if self.overlay.back() != Some(&p) {
            if self.overlay.len() == OVERLAY_TRACE_LEN {
                self.overlay.pop_front();
            }
            self.overlay.push_back(p);
        }
        self.trace.push(p);
    }
}

/// A crossing produced during one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrossingEvent {
    pub track_id: TrackId,
    pub record: VehicleRecord,
    pub points: Vec<PositionPoint>,
}

#[derive(Debug, Default)]
pub struct CrossingStateMachine {
    states: HashMap<TrackId, TrackCrossing>,
    counted_total: u64,
}

impl CrossingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, id: TrackId) -> Option<&TrackCrossing> {
        self.states.get(&id)
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    pub fn counted_total(&self) -> u64 {
        self.counted_total
    }

    /// Evaluate one frame's track snapshots.
    ///
    /// `next_id` is only called when a track becomes counted.
    pub fn observe(
        &mut self,
        tracks: &[TrackSnapshot],
        zones: &ZoneSet,
        now: NaiveDateTime,
        next_id: &mut dyn FnMut() -> VehicleId,
    ) -> Vec<CrossingEvent> {
        // Tracks the tracker no longer reports are gone for good.
        self.states
            .retain(|id, _| tracks.iter().any(|t| t.id == *id));

        let mut events = Vec::new();
        for track in tracks {
            if !track.confirmed || track.frames_since_update > MAX_STALE_FRAMES {
                continue;
            }
            let state = self.states.entry(track.id).or_default();
            if state.is_counted() {
                continue;
            }

            let centroid = track.bbox.centroid();
            state.record_position(centroid);

            if !advance(state, zones, centroid) {
                continue;
            }

            let vehicle_id = next_id();
            state.vehicle_id = Some(vehicle_id);
            self.counted_total += 1;

            let record = VehicleRecord {
                vehicle_id,
                class: track.class.clone(),
                origin: state.origin.clone(),
                exit: state.exit.clone(),
                timestamp: now,
            };
            let points = state
                .trace
                .iter()
                .map(|p| PositionPoint {
                    x: p.x,
                    y: p.y,
                    vehicle_id,
                })
                .collect();

            log::info!(
                "{} #{} counted as vehicle {}: {} -> {} ({} points)",
                track.class,
                track.id,
                vehicle_id,
                record.origin.as_deref().unwrap_or("-"),
                record.exit.as_deref().unwrap_or("-"),
                state.trace.len()
            );
            events.push(CrossingEvent {
                track_id: track.id,
                record,
                points,
            });
        }
        events
    }

    /// Drop overlay traces of counted tracks after their data was flushed.
    pub fn clear_counted_overlays(&mut self) {
        for state in self.states.values_mut() {
            if state.is_counted() {
                state.overlay.clear();
            }
        }
    }
}

/// Apply one centroid to an uncounted track. Returns true when the track
/// just became counted.
fn advance(state: &mut TrackCrossing, zones: &ZoneSet, centroid: Point) -> bool {
    if zones.is_empty() {
        // An origin seen before a reload emptied the zone set does not count.
        state.origin = None;
        state.exit = None;
        return true;
    }
    for zone in zones.zones() {
        if !zone.polygon.contains(centroid) {
            continue;
        }
        match state.origin.as_deref() {
            None => {
                state.origin = Some(zone.name.clone());
                return false;
            }
            Some(origin) if origin != zone.name => {
                state.exit = Some(zone.name.clone());
                return true;
            }
            Some(_) => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::{Polygon, Zone};
    use crate::{now_local, Rect};

    fn zones(defs: &[(&str, Polygon)]) -> ZoneSet {
        ZoneSet::new(
            vec![],
            defs.iter()
                .map(|(name, polygon)| Zone {
                    name: name.to_string(),
                    polygon: polygon.clone(),
                })
                .collect(),
        )
        .unwrap()
    }

    fn two_squares() -> ZoneSet {
        zones(&[
            ("Z1", Polygon::rect(0, 0, 10, 10)),
            ("Z2", Polygon::rect(20, 0, 30, 10)),
        ])
    }

    /// Snapshot whose centroid is exactly (cx, cy).
    fn at(id: TrackId, cx: i32, cy: i32) -> TrackSnapshot {
        TrackSnapshot {
            id,
            class: "car".into(),
            confirmed: true,
            frames_since_update: 0,
            bbox: Rect::new(cx - 2, cy - 2, 4, 4),
        }
    }

    struct Ids(VehicleId);

    impl Ids {
        fn next(&mut self) -> VehicleId {
            self.0 += 1;
            self.0
        }
    }

    fn run(sm: &mut CrossingStateMachine, zs: &ZoneSet, frames: &[Vec<TrackSnapshot>]) -> Vec<CrossingEvent> {
        let mut ids = Ids(0);
        let mut out = Vec::new();
        for tracks in frames {
            out.extend(sm.observe(tracks, zs, now_local(), &mut || ids.next()));
        }
        out
    }

    #[test]
    fn crossing_between_two_zones_counts_once() {
        let zs = two_squares();
        let mut sm = CrossingStateMachine::new();
        let events = run(
            &mut sm,
            &zs,
            &[
                vec![at(1, 5, 5)],
                vec![at(1, 15, 5)],
                vec![at(1, 25, 5)],
                vec![at(1, 5, 5)],
                vec![at(1, 25, 5)],
            ],
        );
        assert_eq!(events.len(), 1);
        let rec = &events[0].record;
        assert_eq!(rec.vehicle_id, 1);
        assert_eq!(rec.origin.as_deref(), Some("Z1"));
        assert_eq!(rec.exit.as_deref(), Some("Z2"));
        let pts: Vec<_> = events[0].points.iter().map(|p| (p.x, p.y)).collect();
        assert_eq!(pts, vec![(5, 5), (15, 5), (25, 5)]);
        assert!(sm.state(1).unwrap().is_counted());
    }

    #[test]
    fn staying_in_origin_never_counts() {
        let zs = two_squares();
        let mut sm = CrossingStateMachine::new();
        let events = run(&mut sm, &zs, &[vec![at(1, 5, 5)], vec![at(1, 6, 6)], vec![at(1, 15, 5)]]);
        assert!(events.is_empty());
        assert_eq!(sm.state(1).unwrap().origin.as_deref(), Some("Z1"));
    }

    #[test]
    fn edge_point_counts_as_inside() {
        let zs = two_squares();
        let mut sm = CrossingStateMachine::new();
        let events = run(&mut sm, &zs, &[vec![at(1, 10, 5)], vec![at(1, 20, 10)]]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record.origin.as_deref(), Some("Z1"));
        assert_eq!(events[0].record.exit.as_deref(), Some("Z2"));
    }

    #[test]
    fn overlapping_zones_resolve_in_document_order() {
        // B overlaps A; a point in both picks the earlier zone as origin.
        let zs = zones(&[
            ("A", Polygon::rect(0, 0, 10, 10)),
            ("B", Polygon::rect(5, 0, 15, 10)),
        ]);
        let mut sm = CrossingStateMachine::new();
        let first = run(&mut sm, &zs, &[vec![at(1, 7, 5)]]);
        assert!(first.is_empty());
        assert_eq!(sm.state(1).unwrap().origin.as_deref(), Some("A"));

        // Still in the overlap: A matches origin, B differs -> exit B.
        let mut ids = Ids(0);
        let events = sm.observe(&[at(1, 8, 5)], &zs, now_local(), &mut || ids.next());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record.exit.as_deref(), Some("B"));
    }

    #[test]
    fn unconfirmed_and_stale_tracks_are_ignored() {
        let zs = two_squares();
        let mut sm = CrossingStateMachine::new();
        let mut tentative = at(1, 5, 5);
        tentative.confirmed = false;
        let mut stale = at(2, 5, 5);
        stale.frames_since_update = 2;
        let mut recent = at(3, 5, 5);
        recent.frames_since_update = 1;

        run(&mut sm, &zs, &[vec![tentative, stale, recent]]);
        assert!(sm.state(1).is_none());
        assert!(sm.state(2).is_none());
        assert_eq!(sm.state(3).unwrap().trace().len(), 1);
    }

    #[test]
    fn no_zones_counts_immediately_with_null_zones() {
        let zs = ZoneSet::default();
        let mut sm = CrossingStateMachine::new();
        let events = run(&mut sm, &zs, &[vec![at(1, 5, 5), at(2, 50, 50)], vec![at(1, 6, 6)]]);
        assert_eq!(events.len(), 2);
        for e in &events {
            assert_eq!(e.record.origin, None);
            assert_eq!(e.record.exit, None);
            assert_eq!(e.points.len(), 1);
        }
        assert_eq!(events[0].record.vehicle_id, 1);
        assert_eq!(events[1].record.vehicle_id, 2);
    }

    #[test]
    fn emptied_zone_set_counts_with_null_zones() {
        let mut sm = CrossingStateMachine::new();
        let mut ids = Ids(0);
        let before = sm.observe(&[at(1, 5, 5)], &two_squares(), now_local(), &mut || ids.next());
        assert!(before.is_empty());
        assert_eq!(sm.state(1).unwrap().origin.as_deref(), Some("Z1"));

        let after = sm.observe(&[at(1, 6, 5)], &ZoneSet::default(), now_local(), &mut || ids.next());
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].record.origin, None);
        assert_eq!(after[0].record.exit, None);
        assert_eq!(after[0].points.len(), 2);
    }

    #[test]
    fn overlay_is_bounded_and_deduplicated() {
        let zs = two_squares();
        let mut sm = CrossingStateMachine::new();
        let mut frames = vec![vec![at(1, 40, 40)], vec![at(1, 40, 40)]];
        for i in 0..12 {
            frames.push(vec![at(1, 41 + i, 40)]);
        }
        run(&mut sm, &zs, &frames);
        let state = sm.state(1).unwrap();
        assert_eq!(state.overlay().len(), OVERLAY_TRACE_LEN);
        assert_eq!(state.overlay().back(), Some(&Point::new(52, 40)));
        assert_eq!(state.trace().len(), 14);
    }

    #[test]
    fn counted_overlays_are_cleared_but_others_kept() {
        let zs = two_squares();
        let mut sm = CrossingStateMachine::new();
        run(
            &mut sm,
            &zs,
            &[
                vec![at(1, 5, 5), at(2, 5, 5)],
                vec![at(1, 25, 5), at(2, 6, 5)],
            ],
        );
        sm.clear_counted_overlays();
        assert!(sm.state(1).unwrap().overlay().is_empty());
        assert_eq!(sm.state(2).unwrap().overlay().len(), 2);
    }

    #[test]
    fn vanished_tracks_are_forgotten() {
        let zs = two_squares();
        let mut sm = CrossingStateMachine::new();
        run(&mut sm, &zs, &[vec![at(1, 5, 5)], vec![at(2, 5, 5)]]);
        assert!(sm.state(1).is_none());
        assert!(sm.state(2).is_some());
    }
}
