use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::DetectorSettings;
use crate::ingest::SourceConfig;
use crate::pipeline::{
    PipelineSettings, DEFAULT_ALLOWED_CLASSES, DEFAULT_FLUSH_MIN_FRAMES,
    DEFAULT_FLUSH_MIN_RECORDS, DEFAULT_STRIDE,
};
use crate::track::IouTrackerConfig;

const DEFAULT_SOURCE_URL: &str = "stub://intersection";
const DEFAULT_WIDTH: u32 = 1248;
const DEFAULT_HEIGHT: u32 = 704;
const DEFAULT_ZONES_PATH: &str = "resources/polygons.json";
const DEFAULT_SNAPSHOT_PATH: &str = "resources/canvas_bg.png";
const DEFAULT_DB_PATH: &str = "counter.db";
const DEFAULT_STORE_DEADLINE_SECS: u64 = 5;
const DEFAULT_FALLBACK_DIR: &str = "data";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_DETECTOR: &str = "stub";

#[derive(Debug, Deserialize, Default)]
struct CounterdConfigFile {
    source: Option<SourceConfigFile>,
    zones_path: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    store: Option<StoreConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    detector: Option<DetectorConfigFile>,
    tracker: Option<TrackerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    enabled: Option<bool>,
    db_path: Option<String>,
    deadline_secs: Option<u64>,
    fallback_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    stride: Option<u64>,
    flush_min_frames: Option<u64>,
    flush_min_records: Option<usize>,
    allowed_classes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    replay_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    iou_threshold: Option<f32>,
    confirm_hits: Option<u32>,
    max_age: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CounterdConfig {
    pub source: SourceConfig,
    pub zones_path: PathBuf,
    /// `None` disables the background snapshot.
    pub snapshot_path: Option<PathBuf>,
    pub store: StoreSettings,
    pub stride: u64,
    pub flush_min_frames: u64,
    pub flush_min_records: usize,
    pub allowed_classes: Vec<String>,
    pub detector: DetectorSettings,
    pub tracker: IouTrackerConfig,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// `false` skips the database; every flush goes to the fallback files.
    pub enabled: bool,
    pub db_path: String,
    /// Upper bound on a blocked database write.
    pub deadline: Duration,
    pub fallback_dir: PathBuf,
}

impl CounterdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("COUNTER_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file taking the place of
    /// `COUNTER_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CounterdConfigFile) -> Result<Self> {
        let source = file.source.unwrap_or_default();
        let store = file.store.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let tracker = file.tracker.unwrap_or_default();
        let tracker_defaults = IouTrackerConfig::default();

        Ok(Self {
            source: SourceConfig {
                url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                width: source.width.unwrap_or(DEFAULT_WIDTH),
                height: source.height.unwrap_or(DEFAULT_HEIGHT),
                max_frames: None,
            },
            zones_path: file
                .zones_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ZONES_PATH)),
            snapshot_path: Some(
                file.snapshot_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            ),
            store: StoreSettings {
                enabled: store.enabled.unwrap_or(true),
                db_path: store.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
                deadline: Duration::from_secs(
                    store.deadline_secs.unwrap_or(DEFAULT_STORE_DEADLINE_SECS),
                ),
                fallback_dir: store
                    .fallback_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FALLBACK_DIR)),
            },
            stride: pipeline.stride.unwrap_or(DEFAULT_STRIDE),
            flush_min_frames: pipeline.flush_min_frames.unwrap_or(DEFAULT_FLUSH_MIN_FRAMES),
            flush_min_records: pipeline
                .flush_min_records
                .unwrap_or(DEFAULT_FLUSH_MIN_RECORDS),
            allowed_classes: pipeline.allowed_classes.unwrap_or_else(|| {
                DEFAULT_ALLOWED_CLASSES
                    .iter()
                    .map(|c| c.to_string())
                    .collect()
            }),
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                replay_path: detector.replay_path,
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE),
            },
            tracker: IouTrackerConfig {
                iou_threshold: tracker
                    .iou_threshold
                    .unwrap_or(tracker_defaults.iou_threshold),
                confirm_hits: tracker.confirm_hits.unwrap_or(tracker_defaults.confirm_hits),
                max_age: tracker.max_age.unwrap_or(tracker_defaults.max_age),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("COUNTER_SOURCE") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(path) = std::env::var("COUNTER_ZONES_PATH") {
            if !path.trim().is_empty() {
                self.zones_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("COUNTER_DB_PATH") {
            if !path.trim().is_empty() {
                self.store.db_path = path;
            }
        }
        if let Ok(enabled) = std::env::var("COUNTER_STORE_ENABLED") {
            self.store.enabled = parse_bool(&enabled)
                .ok_or_else(|| anyhow!("COUNTER_STORE_ENABLED must be true or false"))?;
        }
        if let Ok(dir) = std::env::var("COUNTER_FALLBACK_DIR") {
            if !dir.trim().is_empty() {
                self.store.fallback_dir = PathBuf::from(dir);
            }
        }
        if let Ok(stride) = std::env::var("COUNTER_STRIDE") {
            self.stride = stride
                .trim()
                .parse()
                .map_err(|_| anyhow!("COUNTER_STRIDE must be a positive integer"))?;
        }
        if let Ok(classes) = std::env::var("COUNTER_ALLOWED_CLASSES") {
            let parsed = split_csv(&classes);
            if !parsed.is_empty() {
                self.allowed_classes = parsed;
            }
        }
        if let Ok(confidence) = std::env::var("COUNTER_CONFIDENCE") {
            self.detector.confidence_threshold = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("COUNTER_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Ok(backend) = std::env::var("COUNTER_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_string();
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.stride == 0 {
            return Err(anyhow!("stride must be at least 1"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source width and height must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!("confidence threshold must be within 0..=1"));
        }
        if !(0.0..=1.0).contains(&self.tracker.iou_threshold) {
            return Err(anyhow!("tracker iou threshold must be within 0..=1"));
        }
        if self.store.deadline.is_zero() {
            return Err(anyhow!("store deadline must be greater than zero"));
        }
        match self.detector.backend.as_str() {
            "stub" => {}
            "replay" if self.detector.replay_path.is_some() => {}
            "replay" => return Err(anyhow!("replay detector requires detector.replay_path")),
            other => return Err(anyhow!("unknown detector backend '{}'", other)),
        }

        let mut seen = HashSet::new();
        let mut classes = Vec::with_capacity(self.allowed_classes.len());
        for class in &self.allowed_classes {
            let class = class.trim().to_lowercase();
            if class.is_empty() {
                continue;
            }
            if seen.insert(class.clone()) {
                classes.push(class);
            }
        }
        if classes.is_empty() {
            return Err(anyhow!("allowed classes must not be empty"));
        }
        self.allowed_classes = classes;
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            stride: self.stride,
            flush_min_frames: self.flush_min_frames,
            flush_min_records: self.flush_min_records,
            allowed_classes: self.allowed_classes.iter().cloned().collect(),
            snapshot_path: self.snapshot_path.clone(),
            ..PipelineSettings::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<CounterdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
