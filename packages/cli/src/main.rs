#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the mobility panel pipeline.
//!
//! Each subcommand opens the store, resolves configuration and runs one job
//! until nothing is pending. Re-running a subcommand after an interruption
//! resumes where the last committed chunk left off.

mod config;

use std::path::PathBuf;
use std::time::Instant;

use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use mobility_change::{PeriodStatistic, build_panel, compute_changes, write_geojson};
use mobility_cli_utils::JobProgress;
use mobility_database::{
    ActorStore, DuckDbStore, EventFilter, EventStore, ResultStore, UnitStore,
};
use mobility_jobs::pending::remaining;
use mobility_jobs::units::UnitSource;
use mobility_jobs::{JobReport, cells, homes, units};
use mobility_models::{BucketFrequency, InferenceMethod, ResidencyCounts, SpatialUnit};

use crate::config::MobilityConfig;

#[derive(Parser)]
#[command(name = "mobility", about = "Resident / non-resident mobility panels")]
struct Cli {
    /// Config file (defaults to `mobility.toml` when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// `DuckDB` file (overrides `MOBILITY_DB` and the config file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Targets {
    Homes,
    Areas,
    Cells,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill H3 cell ids onto located events
    AssignCells {
        /// Comma-separated H3 resolutions (defaults to the configured cell
        /// resolution)
        #[arg(long, value_delimiter = ',')]
        resolutions: Vec<u8>,
    },
    /// Infer home/work locations for every actor not yet classified
    Homes {
        /// `latlon` or `cell<resolution>` (e.g. `cell9`)
        #[arg(long)]
        method: Option<InferenceMethod>,
    },
    /// Seed a destination with every cell that has events, for
    /// `count-cells --in-place`
    SeedCells {
        destination: String,
        #[arg(long)]
        resolution: Option<u8>,
    },
    /// Residency counts for every stored area unit
    CountAreas {
        destination: String,
        /// Calendar bucket: daily, weekly, monthly, quarterly, yearly
        #[arg(long)]
        frequency: Option<BucketFrequency>,
    },
    /// Residency counts for every cell that has events
    CountCells {
        destination: String,
        #[arg(long)]
        resolution: Option<u8>,
        #[arg(long)]
        frequency: Option<BucketFrequency>,
        /// Fill seeded placeholder records instead of appending chunks
        #[arg(long)]
        in_place: bool,
    },
    /// Number of actors whose home lies in each unit
    ResidentTotals {
        destination: String,
        /// Count per cell instead of per area unit
        #[arg(long)]
        cells: bool,
        #[arg(long)]
        resolution: Option<u8>,
    },
    /// Show how many targets a job still has to compute
    Pending {
        #[arg(value_enum)]
        targets: Targets,
        /// Result destination (unused for `homes`)
        #[arg(long)]
        destination: Option<String>,
        #[arg(long)]
        method: Option<InferenceMethod>,
        #[arg(long)]
        resolution: Option<u8>,
    },
    /// Before/after change rates of a committed count destination, written
    /// as `GeoJSON`
    Change {
        source: String,
        /// Buckets after this date form the after period (YYYY-MM-DD)
        #[arg(long)]
        cutoff: NaiveDate,
        /// `mean` or `sum`
        #[arg(long, default_value = "mean")]
        statistic: PeriodStatistic,
        #[arg(long, default_value = "changes.geojson")]
        output: PathBuf,
    },
}

fn log_report(job: &str, report: &JobReport) {
    let slowest = report.chunk_times.iter().max().copied().unwrap_or_default();
    log::info!(
        "{job}: committed {} targets in {} chunks, {:.1}s total (slowest chunk {:.2}s)",
        report.committed,
        report.chunks,
        report.elapsed.as_secs_f64(),
        slowest.as_secs_f64()
    );
}

#[allow(clippy::too_many_lines)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = mobility_cli_utils::init_logger();
    let cli = Cli::parse();

    let config = MobilityConfig::load(cli.config.as_deref())?;
    let db_path = config.db_path(cli.db);
    log::info!("Opening store at {}", db_path.display());
    let store = DuckDbStore::open(&db_path)?;

    let options = config.jobs.options();
    let start = Instant::now();

    match cli.command {
        Commands::AssignCells { resolutions } => {
            let resolutions = if resolutions.is_empty() {
                vec![config.residency.cell_resolution]
            } else {
                resolutions
            };
            let progress = JobProgress::batch_spinner(&multi, "Assigning cells");
            let report = cells::assign_cells(
                &store,
                &resolutions,
                config.jobs.cell_batch_size,
                progress.as_ref(),
            )?;
            if !report.failures.is_empty() {
                log::warn!(
                    "{} events could not be assigned cells",
                    report.failures.len()
                );
            }
        }
        Commands::Homes { method } => {
            let method = method.unwrap_or(config.residency.method);
            let progress = JobProgress::targets_bar(&multi, "Inferring homes");
            let report = homes::run(
                &store,
                method,
                &config.inference,
                &options,
                progress.as_ref(),
            )?;
            log_report(&format!("homes ({method})"), &report);
        }
        Commands::SeedCells {
            destination,
            resolution,
        } => {
            let resolution = resolution.unwrap_or(config.residency.cell_resolution);
            cells::seed_cells(&store, &destination, resolution)?;
        }
        Commands::CountAreas {
            destination,
            frequency,
        } => {
            let mut params = config.residency.params();
            params.frequency = frequency.unwrap_or(params.frequency);
            let progress = JobProgress::targets_bar(&multi, "Counting areas");
            let report = units::run_area_counts(
                &store,
                &destination,
                &params,
                &options,
                progress.as_ref(),
            )?;
            log_report(&destination, &report);
        }
        Commands::CountCells {
            destination,
            resolution,
            frequency,
            in_place,
        } => {
            let resolution = resolution.unwrap_or(config.residency.cell_resolution);
            let mut params = config.residency.params();
            params.frequency = frequency.unwrap_or(params.frequency);
            let progress = JobProgress::targets_bar(&multi, "Counting cells");

            let report = if in_place {
                cells::seed_cells(&store, &destination, resolution)?;
                units::run_cell_fill(
                    &store,
                    &destination,
                    &params,
                    config.jobs.fill_batch_size,
                    progress.as_ref(),
                )?
            } else {
                units::run_cell_counts(
                    &store,
                    &destination,
                    resolution,
                    &params,
                    &options,
                    progress.as_ref(),
                )?
            };
            log_report(&destination, &report);
        }
        Commands::ResidentTotals {
            destination,
            cells,
            resolution,
        } => {
            let source = if cells {
                UnitSource::Cells {
                    resolution: resolution.unwrap_or(config.residency.cell_resolution),
                }
            } else {
                UnitSource::Areas
            };
            let progress = JobProgress::targets_bar(&multi, "Counting residents");
            let report = units::run_resident_totals(
                &store,
                &destination,
                source,
                config.residency.method,
                &options,
                progress.as_ref(),
            )?;
            log_report(&destination, &report);
        }
        Commands::Pending {
            targets,
            destination,
            method,
            resolution,
        } => match targets {
            Targets::Homes => {
                let method = method.unwrap_or(config.residency.method);
                let actors = store.distinct_actor_ids()?;
                let done = store.classified_actor_ids(method)?;
                let left = actors.iter().filter(|a| !done.contains(a)).count();
                println!("{left} of {} actors pending for {method}", actors.len());
            }
            Targets::Areas | Targets::Cells => {
                let destination =
                    destination.ok_or("--destination is required for unit targets")?;
                let units: Vec<SpatialUnit> = if matches!(targets, Targets::Areas) {
                    store.area_units()?
                } else {
                    let resolution = resolution.unwrap_or(config.residency.cell_resolution);
                    store
                        .cells_with_events(resolution)?
                        .into_iter()
                        .map(|cell| SpatialUnit::Cell { cell })
                        .collect()
                };
                let done = store.completed_ids(&destination)?;
                println!(
                    "{} of {} units pending for {destination} ({} placeholders unfilled)",
                    remaining(&units, &done),
                    units.len(),
                    store.count_missing(&destination)?
                );
            }
        },
        Commands::Change {
            source,
            cutoff,
            statistic,
            output,
        } => {
            let records = store.all_results(&source)?;
            let counts = records
                .iter()
                .map(|r| Ok((r.target_id.as_str(), r.decode::<ResidencyCounts>()?)))
                .collect::<Result<Vec<_>, mobility_database::DbError>>()?;
            let panel = build_panel(counts.iter().map(|(id, c)| (*id, c)));
            log::info!(
                "Loaded {} panel rows for {} targets from {source}",
                panel.len(),
                counts.len()
            );

            let changes = compute_changes(&panel, cutoff, statistic);
            write_geojson(&output, &changes)?;
        }
    }

    log::info!(
        "Done in {:.1}s ({} events in store)",
        start.elapsed().as_secs_f64(),
        store.count_events(&EventFilter::All)?
    );

    Ok(())
}
