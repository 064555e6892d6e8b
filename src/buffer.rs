//! Pending crossing events between flushes.
//!
//! The buffer is written by the frame loop only. A flush takes ownership of
//! the whole contents via `snapshot_and_clear`; if that flush fails on both
//! the remote and the fallback path, `restore` puts the batch back in front of
//! anything buffered in the meantime.

use crate::{PositionPoint, VehicleId, VehicleRecord};

/// Records and points moving through one flush.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushBatch {
    pub records: Vec<VehicleRecord>,
    pub points: Vec<PositionPoint>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.points.is_empty()
    }

    /// Records with id strictly above `last_id`, and the points that belong
    /// to them.
    pub fn newer_than(&self, last_id: VehicleId) -> FlushBatch {
        let records: Vec<VehicleRecord> = self
            .records
            .iter()
            .filter(|r| r.vehicle_id > last_id)
            .cloned()
            .collect();
        let points = self
            .points
            .iter()
            .filter(|p| p.vehicle_id > last_id)
            .copied()
            .collect();
        FlushBatch { records, points }
    }
}

#[derive(Debug, Default)]
pub struct EventBuffer {
    records: Vec<VehicleRecord>,
    points: Vec<PositionPoint>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: VehicleRecord, points: Vec<PositionPoint>) {
        self.records.push(record);
        self.points.extend(points);
    }

    /// Take everything buffered so far, leaving the buffer empty.
    pub fn snapshot_and_clear(&mut self) -> FlushBatch {
        FlushBatch {
            records: std::mem::take(&mut self.records),
            points: std::mem::take(&mut self.points),
        }
    }

    /// Put back a batch whose flush failed, ahead of newer entries.
    pub fn restore(&mut self, mut batch: FlushBatch) {
        batch.records.append(&mut self.records);
        batch.points.append(&mut self.points);
        self.records = batch.records;
        self.points = batch.points;
    }

    /// Number of buffered vehicle records.
    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.points.is_empty()
    }

    pub fn max_vehicle_id(&self) -> Option<VehicleId> {
        self.records.iter().map(|r| r.vehicle_id).max()
    }

    pub fn records(&self) -> &[VehicleRecord] {
        &self.records
    }
}
