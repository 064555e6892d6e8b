//! export_vehicles - dump counted vehicles or their position points as CSV

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use std::time::Duration;

use intersection_counter::fallback::{point_row, vehicle_row, POINTS_HEADER, VEHICLES_HEADER};
use intersection_counter::{SqliteVehicleStore, VehicleStore};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Vehicles,
    Points,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the vehicle database.
    #[arg(long, env = "COUNTER_DB_PATH", default_value = "counter.db")]
    db_path: String,
    /// First day to export (YYYY-MM-DD).
    #[arg(long)]
    from: NaiveDate,
    /// Last day to export, inclusive (YYYY-MM-DD). Defaults to `--from`.
    #[arg(long)]
    to: Option<NaiveDate>,
    /// What to export.
    #[arg(long, value_enum, default_value_t = Kind::Vehicles)]
    kind: Kind,
    /// Output file path.
    #[arg(long, default_value = "vehicles.csv")]
    output: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let to = args.to.unwrap_or(args.from);
    if to < args.from {
        return Err(anyhow!("--to {} is before --from {}", to, args.from));
    }

    let mut store = SqliteVehicleStore::open(&args.db_path, Duration::from_secs(5))
        .map_err(|e| anyhow!("failed to open {}: {}", args.db_path, e))?;
    let vehicles = store.vehicles_between(args.from, to)?;

    let mut out = String::new();
    let rows = match args.kind {
        Kind::Vehicles => {
            out.push_str(VEHICLES_HEADER);
            out.push('\n');
            for v in &vehicles {
                out.push_str(&vehicle_row(v));
                out.push('\n');
            }
            vehicles.len()
        }
        Kind::Points => {
            out.push_str(POINTS_HEADER);
            out.push('\n');
            let min = vehicles.iter().map(|v| v.vehicle_id).min();
            let max = vehicles.iter().map(|v| v.vehicle_id).max();
            let points = match (min, max) {
                (Some(min), Some(max)) => store.points_for_vehicles(min, max)?,
                _ => Vec::new(),
            };
            for p in &points {
                out.push_str(&point_row(p));
                out.push('\n');
            }
            points.len()
        }
    };

    std::fs::write(&args.output, out)
        .map_err(|e| anyhow!("failed to write {}: {}", args.output, e))?;
    log::info!(
        "exported {} {:?} rows for {}..={} to {}",
        rows,
        args.kind,
        args.from,
        to,
        args.output
    );
    Ok(())
}
