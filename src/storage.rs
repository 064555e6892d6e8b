use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{CountError, CountResult};
use crate::{PositionPoint, VehicleId, VehicleRecord, TIMESTAMP_FORMAT};

/// Durable store for counted vehicles and their position traces.
pub trait VehicleStore: Send {
    /// Highest stored vehicle id, `None` when the store is empty.
    fn last_vehicle_id(&mut self) -> CountResult<Option<VehicleId>>;

    /// All-or-nothing write of records and points.
    fn insert_batch(
        &mut self,
        records: &[VehicleRecord],
        points: &[PositionPoint],
    ) -> CountResult<()>;

    /// Records whose timestamp falls on a day in `from..=to`.
    fn vehicles_between(&mut self, from: NaiveDate, to: NaiveDate)
        -> CountResult<Vec<VehicleRecord>>;

    /// Points for vehicle ids in `min_id..=max_id`.
    fn points_for_vehicles(
        &mut self,
        min_id: VehicleId,
        max_id: VehicleId,
    ) -> CountResult<Vec<PositionPoint>>;
}

/// Store handle shared by the frame loop (id seeding) and the flush worker.
pub type SharedStore = Arc<Mutex<dyn VehicleStore>>;

pub fn lock_store(store: &SharedStore) -> CountResult<MutexGuard<'_, dyn VehicleStore + 'static>> {
    store
        .lock()
        .map_err(|_| CountError::remote("vehicle store lock poisoned"))
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteVehicleStore {
    conn: Connection,
}

impl SqliteVehicleStore {
    /// Open (or create) the database. `deadline` bounds how long a write
    /// waits on a locked database before failing.
    pub fn open(db_path: &str, deadline: Duration) -> CountResult<Self> {
        let conn = if db_path.starts_with("file:") {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(db_path)?
        };
        conn.busy_timeout(deadline)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> CountResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vehicles (
              vehicle_id INTEGER PRIMARY KEY,
              class TEXT NOT NULL,
              origin TEXT,
              exit TEXT,
              timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS position_points (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              x INTEGER NOT NULL,
              y INTEGER NOT NULL,
              vehicle_id INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_vehicles_timestamp ON vehicles(timestamp);
            CREATE INDEX IF NOT EXISTS idx_points_vehicle ON position_points(vehicle_id);
            "#,
        )?;
        Ok(())
    }
}

impl VehicleStore for SqliteVehicleStore {
    fn last_vehicle_id(&mut self) -> CountResult<Option<VehicleId>> {
        let last: Option<VehicleId> = self
            .conn
            .query_row("SELECT MAX(vehicle_id) FROM vehicles", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(last)
    }

    fn insert_batch(
        &mut self,
        records: &[VehicleRecord],
        points: &[PositionPoint],
    ) -> CountResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut insert_vehicle = tx.prepare(
                "INSERT INTO vehicles(vehicle_id, class, origin, exit, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for r in records {
                insert_vehicle.execute(params![
                    r.vehicle_id,
                    r.class,
                    r.origin,
                    r.exit,
                    r.timestamp.format(TIMESTAMP_FORMAT).to_string()
                ])?;
            }

            let mut insert_point = tx.prepare(
                "INSERT INTO position_points(x, y, vehicle_id) VALUES (?1, ?2, ?3)",
            )?;
            for p in points {
                insert_point.execute(params![p.x, p.y, p.vehicle_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn vehicles_between(
        &mut self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> CountResult<Vec<VehicleRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT vehicle_id, class, origin, exit, timestamp FROM vehicles
            WHERE date(timestamp) BETWEEN ?1 AND ?2
            ORDER BY vehicle_id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![
            from.format("%Y-%m-%d").to_string(),
            to.format("%Y-%m-%d").to_string()
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_ts: String = row.get(4)?;
            let timestamp = NaiveDateTime::parse_from_str(&raw_ts, TIMESTAMP_FORMAT)
                .map_err(|e| CountError::remote(format!("corrupt timestamp '{}': {}", raw_ts, e)))?;
            out.push(VehicleRecord {
                vehicle_id: row.get(0)?,
                class: row.get(1)?,
                origin: row.get(2)?,
                exit: row.get(3)?,
                timestamp,
            });
        }
        Ok(out)
    }

    fn points_for_vehicles(
        &mut self,
        min_id: VehicleId,
        max_id: VehicleId,
    ) -> CountResult<Vec<PositionPoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT x, y, vehicle_id FROM position_points WHERE vehicle_id BETWEEN ?1 AND ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![min_id, max_id], |row| {
            Ok(PositionPoint {
                x: row.get(0)?,
                y: row.get(1)?,
                vehicle_id: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for p in rows {
            out.push(p?);
        }
        Ok(out)
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

/// In-memory store with switchable failures.
#[derive(Clone, Debug, Default)]
pub struct InMemoryVehicleStore {
    vehicles: Vec<VehicleRecord>,
    points: Vec<PositionPoint>,
    id_floor: Option<VehicleId>,
    /// Make `insert_batch` fail.
    pub fail_inserts: bool,
    /// Make `last_vehicle_id` fail.
    pub fail_lookups: bool,
    pub insert_calls: usize,
}

impl InMemoryVehicleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend earlier vehicles up to `id` exist.
    pub fn set_last_vehicle_id(&mut self, id: VehicleId) {
        self.id_floor = Some(id);
    }

    pub fn vehicles(&self) -> &[VehicleRecord] {
        &self.vehicles
    }

    pub fn points(&self) -> &[PositionPoint] {
        &self.points
    }
}

impl VehicleStore for InMemoryVehicleStore {
    fn last_vehicle_id(&mut self) -> CountResult<Option<VehicleId>> {
        if self.fail_lookups {
            return Err(CountError::remote("lookup failure injected"));
        }
        let stored = self.vehicles.iter().map(|v| v.vehicle_id).max();
        Ok(stored.max(self.id_floor))
    }

    fn insert_batch(
        &mut self,
        records: &[VehicleRecord],
        points: &[PositionPoint],
    ) -> CountResult<()> {
        self.insert_calls += 1;
        if self.fail_inserts {
            return Err(CountError::remote("insert failure injected"));
        }
        for r in records {
            if self.vehicles.iter().any(|v| v.vehicle_id == r.vehicle_id) {
                return Err(CountError::remote(format!(
                    "duplicate vehicle id {}",
                    r.vehicle_id
                )));
            }
        }
        self.vehicles.extend_from_slice(records);
        self.points.extend_from_slice(points);
        Ok(())
    }

    fn vehicles_between(
        &mut self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> CountResult<Vec<VehicleRecord>> {
        Ok(self
            .vehicles
            .iter()
            .filter(|v| {
                let day = v.timestamp.date();
                day >= from && day <= to
            })
            .cloned()
            .collect())
    }

    fn points_for_vehicles(
        &mut self,
        min_id: VehicleId,
        max_id: VehicleId,
    ) -> CountResult<Vec<PositionPoint>> {
        Ok(self
            .points
            .iter()
            .filter(|p| p.vehicle_id >= min_id && p.vehicle_id <= max_id)
            .copied()
            .collect())
    }
}

// ----------------------------------------------------------------------------
// Offline
// ----------------------------------------------------------------------------

/// Stand-in used when the durable store cannot be opened at startup: every
/// call fails, so ids seed from memory and every flush goes to local fallback.
#[derive(Debug)]
pub struct OfflineStore {
    reason: String,
}

impl OfflineStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable<T>(&self) -> CountResult<T> {
        Err(CountError::remote(format!(
            "store offline: {}",
            self.reason
        )))
    }
}

impl VehicleStore for OfflineStore {
    fn last_vehicle_id(&mut self) -> CountResult<Option<VehicleId>> {
        self.unavailable()
    }

    fn insert_batch(&mut self, _: &[VehicleRecord], _: &[PositionPoint]) -> CountResult<()> {
        self.unavailable()
    }

    fn vehicles_between(&mut self, _: NaiveDate, _: NaiveDate) -> CountResult<Vec<VehicleRecord>> {
        self.unavailable()
    }

    fn points_for_vehicles(
        &mut self,
        _: VehicleId,
        _: VehicleId,
    ) -> CountResult<Vec<PositionPoint>> {
        self.unavailable()
    }
}
