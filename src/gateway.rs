//! Batched persistence with local fallback.
//!
//! Flush protocol:
//! 1. Ask the durable store for its last vehicle id and drop buffered records
//!    that are not newer (a batch flushed twice is written once).
//! 2. Write the remaining records and their points in one all-or-nothing batch.
//! 3. If either step fails, append the pending batch to the local fallback
//!    files instead. When step 1 failed nothing could be filtered and the
//!    whole batch goes to fallback.
//!
//! A flush succeeds when step 2 or step 3 succeeds. If both fail the caller
//! keeps the batch for a later attempt.
//!
//! `Flusher` runs flushes on a worker thread, one at a time.

use chrono::{Local, NaiveDate};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;

use crate::buffer::FlushBatch;
use crate::error::{CountError, CountResult};
use crate::fallback::LocalFallback;
use crate::storage::{lock_store, SharedStore};

/// Where a successful flush put its data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    Remote {
        records: usize,
        points: usize,
        /// Records dropped as already stored.
        skipped: usize,
    },
    Fallback {
        records: usize,
        points: usize,
        reason: String,
    },
}

pub struct PersistenceGateway {
    store: SharedStore,
    fallback: LocalFallback,
}

impl PersistenceGateway {
    pub fn new(store: SharedStore, fallback: LocalFallback) -> Self {
        Self { store, fallback }
    }

    pub fn flush(&self, batch: &FlushBatch) -> CountResult<FlushOutcome> {
        self.flush_on(batch, Local::now().date_naive())
    }

    /// Flush with an explicit fallback day.
    pub fn flush_on(&self, batch: &FlushBatch, day: NaiveDate) -> CountResult<FlushOutcome> {
        let (pending, err) = match self.write_remote(batch) {
            Ok(outcome) => return Ok(outcome),
            Err((pending, err)) => (pending, err),
        };
        log::warn!(
            "failed to save {} vehicles to the store ({}); saving locally instead",
            pending.records.len(),
            err
        );

        match self.fallback.write_batch(&pending, day) {
            Ok(()) => {
                log::info!(
                    "saved {} vehicles / {} points to {}",
                    pending.records.len(),
                    pending.points.len(),
                    self.fallback.dir().display()
                );
                Ok(FlushOutcome::Fallback {
                    records: pending.records.len(),
                    points: pending.points.len(),
                    reason: err.to_string(),
                })
            }
            Err(fallback_err) => {
                log::warn!(
                    "local fallback failed, keeping {} vehicles buffered: {}",
                    batch.records.len(),
                    fallback_err
                );
                Err(fallback_err)
            }
        }
    }

    /// On failure returns the batch that still needs a home.
    fn write_remote(&self, batch: &FlushBatch) -> Result<FlushOutcome, (FlushBatch, CountError)> {
        let started = std::time::Instant::now();
        let mut store = lock_store(&self.store).map_err(|e| (batch.clone(), e))?;

        let last_id = store.last_vehicle_id().map_err(|e| (batch.clone(), e))?;
        let pending = match last_id {
            Some(last) => batch.newer_than(last),
            None => batch.clone(),
        };
        let skipped = batch.records.len() - pending.records.len();
        if skipped > 0 {
            log::warn!("skipping {} vehicles already in the store", skipped);
        }
        if pending.is_empty() {
            return Ok(FlushOutcome::Remote {
                records: 0,
                points: 0,
                skipped,
            });
        }

        match store.insert_batch(&pending.records, &pending.points) {
            Ok(()) => {
                log::info!(
                    "saved {} vehicles / {} points to the store in {:.3}s",
                    pending.records.len(),
                    pending.points.len(),
                    started.elapsed().as_secs_f64()
                );
                Ok(FlushOutcome::Remote {
                    records: pending.records.len(),
                    points: pending.points.len(),
                    skipped,
                })
            }
            Err(e) => Err((pending, e)),
        }
    }
}

// ----------------------------------------------------------------------------
// Background flushing
// ----------------------------------------------------------------------------

/// Result of one background flush. The batch comes back so a failed flush can
/// be restored into the buffer.
#[derive(Debug)]
pub struct FlushReport {
    pub batch: FlushBatch,
    pub result: CountResult<FlushOutcome>,
}

/// Single worker thread running at most one flush at a time.
///
/// A copy of the in-flight batch is kept so it can be handed back if the
/// worker dies before reporting.
pub struct Flusher {
    jobs: Option<Sender<FlushBatch>>,
    reports: Receiver<FlushReport>,
    in_flight: Option<FlushBatch>,
    worker: Option<JoinHandle<()>>,
}

impl Flusher {
    pub fn spawn(gateway: PersistenceGateway) -> CountResult<Self> {
        let (job_tx, job_rx) = mpsc::channel::<FlushBatch>();
        let (report_tx, report_rx) = mpsc::channel::<FlushReport>();
        let worker = std::thread::Builder::new()
            .name("flusher".into())
            .spawn(move || {
                for batch in job_rx {
                    let result = gateway.flush(&batch);
                    if report_tx.send(FlushReport { batch, result }).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| CountError::remote(format!("cannot start flush worker: {}", e)))?;
        Ok(Self {
            jobs: Some(job_tx),
            reports: report_rx,
            in_flight: None,
            worker: Some(worker),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Start a flush. A busy flusher hands the batch back untouched.
    pub fn submit(&mut self, batch: FlushBatch) -> Result<(), FlushBatch> {
        if self.in_flight.is_some() {
            return Err(batch);
        }
        let Some(jobs) = self.jobs.as_ref() else {
            return Err(batch);
        };
        let copy = batch.clone();
        match jobs.send(batch) {
            Ok(()) => {
                self.in_flight = Some(copy);
                Ok(())
            }
            Err(mpsc::SendError(batch)) => Err(batch),
        }
    }

    /// Non-blocking check for a finished flush.
    pub fn poll(&mut self) -> Option<FlushReport> {
        self.in_flight.as_ref()?;
        match self.reports.try_recv() {
            Ok(report) => {
                self.in_flight = None;
                Some(report)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.in_flight.take().map(worker_lost),
        }
    }

    /// Block until the in-flight flush (if any) finishes.
    pub fn wait(&mut self) -> Option<FlushReport> {
        let batch = self.in_flight.take()?;
        match self.reports.recv() {
            Ok(report) => Some(report),
            Err(_) => Some(worker_lost(batch)),
        }
    }
}

/// Report for a batch whose worker exited without answering.
fn worker_lost(batch: FlushBatch) -> FlushReport {
    log::error!(
        "flush worker exited with {} vehicles in flight; keeping them buffered",
        batch.records.len()
    );
    FlushReport {
        batch,
        result: Err(CountError::remote("flush worker exited")),
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryVehicleStore;
    use crate::{now_local, PositionPoint, VehicleId, VehicleRecord};
    use std::sync::{Arc, Mutex};

    fn batch(ids: &[VehicleId]) -> FlushBatch {
        FlushBatch {
            records: ids
                .iter()
                .map(|&id| VehicleRecord {
                    vehicle_id: id,
                    class: "bus".into(),
                    origin: Some("a".into()),
                    exit: Some("b".into()),
                    timestamp: now_local(),
                })
                .collect(),
            points: ids
                .iter()
                .map(|&id| PositionPoint { x: 1, y: 1, vehicle_id: id })
                .collect(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    fn setup(store: InMemoryVehicleStore) -> (Arc<Mutex<InMemoryVehicleStore>>, PersistenceGateway, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(store));
        let shared: SharedStore = store.clone();
        let gw = PersistenceGateway::new(shared, LocalFallback::new(dir.path()));
        (store, gw, dir)
    }

    #[test]
    fn remote_write_skips_already_stored_ids() {
        let mut inner = InMemoryVehicleStore::new();
        inner.set_last_vehicle_id(2);
        let (store, gw, _dir) = setup(inner);

        let outcome = gw.flush_on(&batch(&[1, 2, 3, 4]), day()).unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Remote { records: 2, points: 2, skipped: 2 }
        );
        let ids: Vec<_> = store.lock().unwrap().vehicles().iter().map(|v| v.vehicle_id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn double_flush_writes_once() {
        let (store, gw, dir) = setup(InMemoryVehicleStore::new());
        let b = batch(&[1, 2]);
        gw.flush_on(&b, day()).unwrap();
        let second = gw.flush_on(&b, day()).unwrap();
        assert_eq!(second, FlushOutcome::Remote { records: 0, points: 0, skipped: 2 });
        assert_eq!(store.lock().unwrap().vehicles().len(), 2);
        assert_eq!(store.lock().unwrap().insert_calls, 1);
        assert!(LocalFallback::new(dir.path()).read_vehicles(day()).unwrap().is_empty());
    }

    #[test]
    fn insert_failure_goes_to_fallback_filtered() {
        let mut inner = InMemoryVehicleStore::new();
        inner.set_last_vehicle_id(1);
        inner.fail_inserts = true;
        let (store, gw, dir) = setup(inner);

        let outcome = gw.flush_on(&batch(&[1, 2, 3]), day()).unwrap();
        assert!(matches!(outcome, FlushOutcome::Fallback { records: 2, points: 2, .. }));
        assert!(store.lock().unwrap().vehicles().is_empty());

        let fb = LocalFallback::new(dir.path());
        let ids: Vec<_> = fb.read_vehicles(day()).unwrap().iter().map(|v| v.vehicle_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn lookup_failure_sends_whole_batch_to_fallback() {
        let mut inner = InMemoryVehicleStore::new();
        inner.fail_lookups = true;
        let (store, gw, dir) = setup(inner);

        let outcome = gw.flush_on(&batch(&[5, 6]), day()).unwrap();
        assert!(matches!(outcome, FlushOutcome::Fallback { records: 2, .. }));
        assert_eq!(store.lock().unwrap().insert_calls, 0);
        assert_eq!(LocalFallback::new(dir.path()).read_points(day()).unwrap().len(), 2);
    }

    #[test]
    fn both_paths_failing_is_an_error() {
        let mut inner = InMemoryVehicleStore::new();
        inner.fail_inserts = true;
        let file = tempfile::NamedTempFile::new().unwrap();
        let store: SharedStore = Arc::new(Mutex::new(inner));
        let gw = PersistenceGateway::new(store, LocalFallback::new(file.path()));

        let err = gw.flush_on(&batch(&[1]), day()).unwrap_err();
        assert!(matches!(err, CountError::LocalFallback(_)));
    }

    #[test]
    fn flusher_runs_one_job_at_a_time() {
        let (store, gw, _dir) = setup(InMemoryVehicleStore::new());
        let mut flusher = Flusher::spawn(gw).unwrap();

        assert!(flusher.submit(batch(&[1])).is_ok());
        assert!(flusher.is_busy());
        let rejected = flusher.submit(batch(&[2])).unwrap_err();
        assert_eq!(rejected.records[0].vehicle_id, 2);

        let report = flusher.wait().unwrap();
        assert!(report.result.is_ok());
        assert!(!flusher.is_busy());
        assert!(flusher.poll().is_none());
        assert_eq!(store.lock().unwrap().vehicles().len(), 1);
    }

    struct PanickingStore;

    impl crate::storage::VehicleStore for PanickingStore {
        fn last_vehicle_id(&mut self) -> CountResult<Option<VehicleId>> {
            panic!("store driver crashed");
        }

        fn insert_batch(&mut self, _: &[VehicleRecord], _: &[PositionPoint]) -> CountResult<()> {
            Ok(())
        }

        fn vehicles_between(&mut self, _: NaiveDate, _: NaiveDate) -> CountResult<Vec<VehicleRecord>> {
            Ok(Vec::new())
        }

        fn points_for_vehicles(&mut self, _: VehicleId, _: VehicleId) -> CountResult<Vec<PositionPoint>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn dead_worker_hands_the_batch_back() {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedStore = Arc::new(Mutex::new(PanickingStore));
        let gw = PersistenceGateway::new(store, LocalFallback::new(dir.path()));
        let mut flusher = Flusher::spawn(gw).unwrap();

        flusher.submit(batch(&[7, 8])).unwrap();
        let report = flusher.wait().unwrap();
        assert!(matches!(report.result, Err(CountError::RemoteStore(_))));
        let ids: Vec<_> = report.batch.records.iter().map(|r| r.vehicle_id).collect();
        assert_eq!(ids, vec![7, 8]);
        assert!(!flusher.is_busy());

        // A later batch comes back either way.
        match flusher.submit(batch(&[9])) {
            Err(returned) => assert_eq!(returned.records[0].vehicle_id, 9),
            Ok(()) => {
                let report = flusher.wait().unwrap();
                assert!(report.result.is_err());
                assert_eq!(report.batch.records[0].vehicle_id, 9);
            }
        }
    }
}
