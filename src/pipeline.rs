//! Frame loop driver.
//!
//! One `Pipeline` owns every piece of per-run state: the zone map, detector,
//! tracker, crossing state, id allocator, event buffer and the flush worker.
//! Frames are processed strictly one after another; the only work that leaves
//! the loop is the flush, which runs on the `Flusher` thread.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::allocator::VehicleIdAllocator;
use crate::buffer::EventBuffer;
use crate::crossing::CrossingStateMachine;
use crate::detect::DetectorBackend;
use crate::error::{CountError, CountResult};
use crate::fallback::LocalFallback;
use crate::frame::Frame;
use crate::gateway::{FlushOutcome, FlushReport, Flusher, PersistenceGateway};
use crate::ingest::FrameSource;
use crate::now_local;
use crate::storage::SharedStore;
use crate::track::Tracker;
use crate::zones::{ZoneFileWatcher, ZoneMap, ZoneSet};

pub const DEFAULT_STRIDE: u64 = 3;
/// About five minutes of 15 fps video.
pub const DEFAULT_FLUSH_MIN_FRAMES: u64 = 4500;
pub const DEFAULT_FLUSH_MIN_RECORDS: usize = 11;
pub const DEFAULT_ALLOWED_CLASSES: [&str; 3] = ["car", "bus", "truck"];

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Run detection on every `stride`-th pulled frame.
    pub stride: u64,
    /// Frames pulled since the last flush before another one may start.
    pub flush_min_frames: u64,
    /// Buffered vehicle records before a flush may start.
    pub flush_min_records: usize,
    /// Lowercase class names passed to the detector.
    pub allowed_classes: HashSet<String>,
    /// Where the first frame of the run is written as PNG.
    pub snapshot_path: Option<PathBuf>,
    pub health_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stride: DEFAULT_STRIDE,
            flush_min_frames: DEFAULT_FLUSH_MIN_FRAMES,
            flush_min_records: DEFAULT_FLUSH_MIN_RECORDS,
            allowed_classes: DEFAULT_ALLOWED_CLASSES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            snapshot_path: None,
            health_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineStats {
    pub frames_pulled: u64,
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub vehicles_counted: u64,
    pub flushes_remote: u64,
    pub flushes_fallback: u64,
    pub flushes_failed: u64,
    /// Instantaneous rate between the last two processed frames.
    pub fps: f64,
}

/// What `step` did with one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not a sampled frame.
    Skipped,
    Processed { counted: usize },
    /// Detector or tracker failed; the frame was dropped.
    Failed,
}

pub struct Pipeline {
    settings: PipelineSettings,
    zones: ZoneMap,
    watcher: Option<ZoneFileWatcher>,
    detector: Box<dyn DetectorBackend>,
    tracker: Box<dyn Tracker>,
    crossing: CrossingStateMachine,
    allocator: VehicleIdAllocator,
    buffer: EventBuffer,
    store: SharedStore,
    flusher: Flusher,
    stats: PipelineStats,
    frames_since_flush: u64,
    last_processed: Option<Instant>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        zones: ZoneMap,
        detector: Box<dyn DetectorBackend>,
        tracker: Box<dyn Tracker>,
        store: SharedStore,
        fallback: LocalFallback,
    ) -> CountResult<Self> {
        if settings.stride == 0 {
            return Err(CountError::config("stride must be at least 1"));
        }
        let watcher = if zones.path().as_os_str().is_empty() {
            None
        } else {
            Some(ZoneFileWatcher::new(zones.path()))
        };
        let flusher = Flusher::spawn(PersistenceGateway::new(store.clone(), fallback))?;
        log::info!(
            "pipeline: detector={} tracker={} stride={} flush>={} frames and >={} vehicles",
            detector.name(),
            tracker.name(),
            settings.stride,
            settings.flush_min_frames,
            settings.flush_min_records
        );
        Ok(Self {
            settings,
            zones,
            watcher,
            detector,
            tracker,
            crossing: CrossingStateMachine::new(),
            allocator: VehicleIdAllocator::new(),
            buffer: EventBuffer::new(),
            store,
            flusher,
            stats: PipelineStats::default(),
            frames_since_flush: 0,
            last_processed: None,
        })
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    pub fn crossing(&self) -> &CrossingStateMachine {
        &self.crossing
    }

    pub fn zones(&self) -> &ZoneMap {
        &self.zones
    }

    pub fn flush_in_flight(&self) -> bool {
        self.flusher.is_busy()
    }

    /// Handle one pulled frame.
    pub fn step(&mut self, frame: &Frame) -> FrameOutcome {
        self.stats.frames_pulled += 1;
        self.frames_since_flush += 1;
        if self.stats.frames_pulled == 1 {
            self.snapshot_background(frame);
        }
        self.collect_flush();

        if self.stats.frames_pulled % self.settings.stride != 0 {
            return FrameOutcome::Skipped;
        }

        // Zone changes land only here, between frames.
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.poll(&self.zones.signal());
        }
        self.zones.reload_if_signaled();
        let zones = self.zones.current();

        let counted = match self.process(frame, &zones) {
            Ok(counted) => counted,
            Err(e) => {
                self.stats.frames_failed += 1;
                log::warn!("frame {} skipped: {}", frame.seq, e);
                return FrameOutcome::Failed;
            }
        };
        self.stats.frames_processed += 1;
        self.update_fps();
        self.maybe_flush();
        FrameOutcome::Processed { counted }
    }

    fn process(&mut self, frame: &Frame, zones: &ZoneSet) -> CountResult<usize> {
        let masked;
        let input = if zones.mask.is_empty() {
            frame
        } else {
            masked = frame.masked(&zones.mask);
            &masked
        };

        let detections = self.detector.detect(input, &self.settings.allowed_classes)?;
        self.tracker.predict();
        self.tracker.update(&detections)?;
        let tracks = self.tracker.tracks();

        let buffer = &self.buffer;
        let allocator = &mut self.allocator;
        let store = &self.store;
        let events = self.crossing.observe(&tracks, zones, now_local(), &mut || {
            allocator.next_id(buffer.max_vehicle_id(), store)
        });

        let counted = events.len();
        for event in events {
            self.buffer.add(event.record, event.points);
        }
        self.stats.vehicles_counted += counted as u64;
        Ok(counted)
    }

    fn update_fps(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.last_processed {
            let dt = now.duration_since(prev).as_secs_f64();
            if dt > 0.0 {
                self.stats.fps = 1.0 / dt;
            }
        }
        self.last_processed = Some(now);
    }

    fn snapshot_background(&self, frame: &Frame) {
        let Some(path) = self.settings.snapshot_path.as_ref() else {
            return;
        };
        match frame.write_png(path) {
            Ok(()) => log::info!("background snapshot written to {}", path.display()),
            Err(e) => log::warn!("background snapshot failed: {}", e),
        }
    }

    fn maybe_flush(&mut self) {
        if self.frames_since_flush < self.settings.flush_min_frames
            || self.buffer.size() < self.settings.flush_min_records
        {
            return;
        }
        if self.flusher.is_busy() {
            log::debug!("flush deferred: previous flush still running");
            return;
        }
        let batch = self.buffer.snapshot_and_clear();
        log::debug!(
            "flushing {} vehicles / {} points",
            batch.records.len(),
            batch.points.len()
        );
        match self.flusher.submit(batch) {
            Ok(()) => {
                self.frames_since_flush = 0;
                self.crossing.clear_counted_overlays();
            }
            Err(batch) => self.buffer.restore(batch),
        }
    }

    fn collect_flush(&mut self) {
        if let Some(report) = self.flusher.poll() {
            self.apply_report(report);
        }
    }

    /// Book-keep a finished flush. A batch that found no home goes back into
    /// the buffer and the flush error is returned.
    fn settle(&mut self, report: FlushReport) -> CountResult<()> {
        match report.result {
            Ok(FlushOutcome::Remote { .. }) => {
                self.stats.flushes_remote += 1;
                Ok(())
            }
            Ok(FlushOutcome::Fallback { .. }) => {
                self.stats.flushes_fallback += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.flushes_failed += 1;
                self.buffer.restore(report.batch);
                Err(e)
            }
        }
    }

    /// Settle a background flush. Failures are retried on a later trigger.
    fn apply_report(&mut self, report: FlushReport) {
        let kept = report.batch.records.len();
        if let Err(e) = self.settle(report) {
            log::error!(
                "flush failed on both paths, {} vehicles kept in buffer: {}",
                kept,
                e
            );
        }
    }

    /// Wait for the in-flight flush, then flush whatever is still buffered.
    pub fn finish(&mut self) -> CountResult<()> {
        if let Some(report) = self.flusher.wait() {
            self.apply_report(report);
        }
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch = self.buffer.snapshot_and_clear();
        log::info!(
            "final flush of {} vehicles / {} points",
            batch.records.len(),
            batch.points.len()
        );
        if let Err(batch) = self.flusher.submit(batch) {
            self.buffer.restore(batch);
            return Err(CountError::remote("flush worker unavailable"));
        }
        let report = self
            .flusher
            .wait()
            .ok_or_else(|| CountError::remote("flush worker exited"))?;
        let kept = report.batch.records.len();
        self.settle(report).map_err(|e| {
            log::error!("final flush failed, {} vehicles not saved: {}", kept, e);
            e
        })
    }

    /// Pull frames until the source ends or `shutdown` is set, then flush.
    pub fn run(&mut self, source: &mut dyn FrameSource, shutdown: &AtomicBool) -> Result<()> {
        log::info!("reading frames from {}", source.describe());
        let driven = self.drive(source, shutdown);
        let finished = self.finish();
        log::info!(
            "stopped after {} frames ({} processed, {} vehicles counted)",
            self.stats.frames_pulled,
            self.stats.frames_processed,
            self.stats.vehicles_counted
        );
        driven?;
        finished?;
        Ok(())
    }

    fn drive(&mut self, source: &mut dyn FrameSource, shutdown: &AtomicBool) -> Result<()> {
        let mut last_health_log = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            let Some(frame) = source.next_frame()? else {
                log::info!("end of stream");
                break;
            };
            self.step(&frame);

            if last_health_log.elapsed() >= self.settings.health_interval {
                log::info!(
                    "health frames={} processed={} failed={} fps={:.1} buffered={} tracks={} counted={}",
                    source.frames_captured(),
                    self.stats.frames_processed,
                    self.stats.frames_failed,
                    self.stats.fps,
                    self.buffer.size(),
                    self.crossing.tracked(),
                    self.crossing.counted_total()
                );
                last_health_log = Instant::now();
            }
        }
        Ok(())
    }
}
