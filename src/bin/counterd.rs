//! counterd - intersection counting daemon
//!
//! This daemon:
//! 1. Loads configuration (file from `COUNTER_CONFIG` / `--config`, then env)
//! 2. Loads the zone map; a missing or broken zone file is fatal
//! 3. Opens the vehicle database, or runs offline with local fallback only
//!    (when `store.enabled` is false or the database cannot be opened)
//! 4. Pulls frames, detects, tracks and counts zone-to-zone crossings
//! 5. Flushes counted vehicles in batches and once more on shutdown

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use intersection_counter::config::CounterdConfig;
use intersection_counter::detect::build_backend;
use intersection_counter::ingest::open_source;
use intersection_counter::{
    IouTracker, LocalFallback, OfflineStore, Pipeline, SharedStore, SqliteVehicleStore, ZoneMap,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "COUNTER_CONFIG")]
    config: Option<PathBuf>,
    /// Stop after this many frames (default: until end of stream).
    #[arg(long)]
    max_frames: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = CounterdConfig::load_from(args.config.as_deref())?;

    let zones = ZoneMap::open(&cfg.zones_path)
        .map_err(|e| anyhow!("cannot start without zones: {}", e))?;

    let store: SharedStore = if !cfg.store.enabled {
        log::info!(
            "vehicle database disabled, saving to {} only",
            cfg.store.fallback_dir.display()
        );
        Arc::new(Mutex::new(OfflineStore::new("database disabled in config")))
    } else {
        match SqliteVehicleStore::open(&cfg.store.db_path, cfg.store.deadline) {
            Ok(store) => {
                log::info!("vehicle database: {}", cfg.store.db_path);
                Arc::new(Mutex::new(store))
            }
            Err(e) => {
                log::warn!(
                    "vehicle database {} unavailable, saving to {} only: {}",
                    cfg.store.db_path,
                    cfg.store.fallback_dir.display(),
                    e
                );
                Arc::new(Mutex::new(OfflineStore::new(e.to_string())))
            }
        }
    };

    let mut detector = build_backend(&cfg.detector)?;
    detector.warm_up()?;
    let tracker = IouTracker::new(cfg.tracker.clone());

    let mut source_cfg = cfg.source.clone();
    source_cfg.max_frames = args.max_frames;
    let mut source = open_source(&source_cfg)?;

    let mut pipeline = Pipeline::new(
        cfg.pipeline_settings(),
        zones,
        detector,
        Box::new(tracker),
        store,
        LocalFallback::new(&cfg.store.fallback_dir),
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    log::info!(
        "counterd running. zones={} classes={}",
        cfg.zones_path.display(),
        cfg.allowed_classes.join(",")
    );
    pipeline.run(source.as_mut(), &shutdown)?;

    let stats = pipeline.stats();
    log::info!(
        "counterd stopped: {} vehicles counted, flushes remote={} fallback={} failed={}",
        stats.vehicles_counted,
        stats.flushes_remote,
        stats.flushes_fallback,
        stats.flushes_failed
    );
    Ok(())
}
