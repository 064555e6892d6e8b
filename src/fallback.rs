//! Local fallback storage.
//!
//! One append-only, `;`-delimited file per calendar day and entity kind:
//! `vehicles-YYYY-MM-DD.csv` and `points-YYYY-MM-DD.csv`. A header row is
//! written when a file is created. Empty fields stand for null zones.

use chrono::{NaiveDate, NaiveDateTime};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::buffer::FlushBatch;
use crate::error::{CountError, CountResult};
use crate::{PositionPoint, VehicleRecord, TIMESTAMP_FORMAT};

pub const VEHICLES_HEADER: &str = "VehicleID;Class;IntersectionOrigin;IntersectionExit;Timestamp";
pub const POINTS_HEADER: &str = "X_point;Y_point;VehicleID";

#[derive(Clone, Debug)]
pub struct LocalFallback {
    dir: PathBuf,
}

impl LocalFallback {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn vehicles_path(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("vehicles-{}.csv", day.format("%Y-%m-%d")))
    }

    pub fn points_path(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("points-{}.csv", day.format("%Y-%m-%d")))
    }

    /// Append a batch to the files for `day`.
    pub fn write_batch(&self, batch: &FlushBatch, day: NaiveDate) -> CountResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            CountError::fallback(format!(
                "cannot create fallback dir {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut vehicles = String::new();
        for r in &batch.records {
            vehicles.push_str(&vehicle_row(r));
            vehicles.push('\n');
        }
        let mut points = String::new();
        for p in &batch.points {
            points.push_str(&point_row(p));
            points.push('\n');
        }

        append(&self.vehicles_path(day), VEHICLES_HEADER, &vehicles)?;
        append(&self.points_path(day), POINTS_HEADER, &points)?;
        Ok(())
    }

    pub fn read_vehicles(&self, day: NaiveDate) -> CountResult<Vec<VehicleRecord>> {
        let mut out = Vec::new();
        for (lineno, fields) in read_rows(&self.vehicles_path(day))? {
            if fields.len() != 5 {
                return Err(bad_row(lineno, "expected 5 fields"));
            }
            let vehicle_id = fields[0]
                .parse()
                .map_err(|_| bad_row(lineno, "invalid vehicle id"))?;
            let timestamp = NaiveDateTime::parse_from_str(&fields[4], TIMESTAMP_FORMAT)
                .map_err(|_| bad_row(lineno, "invalid timestamp"))?;
            out.push(VehicleRecord {
                vehicle_id,
                class: fields[1].clone(),
                origin: non_empty(&fields[2]),
                exit: non_empty(&fields[3]),
                timestamp,
            });
        }
        Ok(out)
    }

    pub fn read_points(&self, day: NaiveDate) -> CountResult<Vec<PositionPoint>> {
        let mut out = Vec::new();
        for (lineno, fields) in read_rows(&self.points_path(day))? {
            if fields.len() != 3 {
                return Err(bad_row(lineno, "expected 3 fields"));
            }
            let parse = |s: &str| s.parse::<i64>().map_err(|_| bad_row(lineno, "invalid number"));
            out.push(PositionPoint {
                x: parse(fields[0].as_str())? as i32,
                y: parse(fields[1].as_str())? as i32,
                vehicle_id: parse(fields[2].as_str())?,
            });
        }
        Ok(out)
    }
}

/// One `;`-delimited vehicle row without line terminator.
pub fn vehicle_row(r: &VehicleRecord) -> String {
    format!(
        "{};{};{};{};{}",
        r.vehicle_id,
        sanitize(&r.class),
        r.origin.as_deref().map(sanitize).unwrap_or_default(),
        r.exit.as_deref().map(sanitize).unwrap_or_default(),
        r.timestamp.format(TIMESTAMP_FORMAT)
    )
}

pub fn point_row(p: &PositionPoint) -> String {
    format!("{};{};{}", p.x, p.y, p.vehicle_id)
}

fn append(path: &Path, header: &str, body: &str) -> CountResult<()> {
    let is_new = !path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CountError::fallback(format!("cannot open {}: {}", path.display(), e)))?;
    let mut out = String::with_capacity(header.len() + body.len() + 1);
    if is_new {
        out.push_str(header);
        out.push('\n');
    }
    out.push_str(body);
    file.write_all(out.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| CountError::fallback(format!("write to {} failed: {}", path.display(), e)))
}

/// Data rows (header skipped) with 1-based line numbers. Missing file = no rows.
fn read_rows(path: &Path) -> CountResult<Vec<(usize, Vec<String>)>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CountError::fallback(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        }
    };
    Ok(raw
        .lines()
        .enumerate()
        .skip(1)
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| (i + 1, line.split(';').map(str::to_string).collect()))
        .collect())
}

fn sanitize(field: &str) -> String {
    field.replace([';', '\n', '\r'], "_")
}

fn non_empty(field: &str) -> Option<String> {
    if field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

fn bad_row(lineno: usize, what: &str) -> CountError {
    CountError::fallback(format!("fallback row {}: {}", lineno, what))
}
