//! Per-unit residency counts and resident totals.

use std::collections::BTreeSet;
use std::error::Error;

use mobility_database::{
    ActorStore, EventFilter, EventStore, HomeFilter, ResultRecord, ResultStore, UnitStore,
};
use mobility_models::{
    ActorId, BucketFrequency, Event, InferenceMethod, ResidentTotal, SpatialUnit,
};
use mobility_residency::{HomeDirectory, classify, count_residents};
use mobility_spatial::{TargetUnit, UnitIndex, bucket_point, cell_index};

use crate::JobError;
use crate::engine::{
    Destination, JobOptions, JobReport, ResultDestination, run_chunked, run_fill_missing,
};
use crate::pending::{pending, remaining};
use crate::progress::ProgressCallback;

/// How events are attributed to residents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidencyParams {
    /// Which home classifications define residency.
    pub method: InferenceMethod,
    /// Neighbor ring distance for cell units.
    pub neighbor_ring: u32,
    pub frequency: BucketFrequency,
}

impl Default for ResidencyParams {
    fn default() -> Self {
        Self {
            method: InferenceMethod::GridCell { resolution: 9 },
            neighbor_ring: 1,
            frequency: BucketFrequency::Quarterly,
        }
    }
}

/// Homes of the distinct authors of `events`.
fn homes_of<S: ActorStore>(
    store: &S,
    method: InferenceMethod,
    events: &[Event],
) -> Result<HomeDirectory, mobility_database::DbError> {
    let actors: Vec<ActorId> = events
        .iter()
        .map(|e| e.actor_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if actors.is_empty() {
        return Ok(HomeDirectory::default());
    }

    let homes = store.find_homes(method, &HomeFilter::Actors(&actors))?;
    Ok(HomeDirectory::from_classifications(
        homes.iter().map(|(actor, c)| (*actor, c)),
    ))
}

/// Residency counts for one unit, ready to commit.
fn unit_counts<S: EventStore + ActorStore>(
    store: &S,
    unit: &TargetUnit,
    params: &ResidencyParams,
) -> Result<ResultRecord, Box<dyn Error>> {
    let filter = match unit {
        TargetUnit::Cell(cell) => EventFilter::InCell {
            cell: u64::from(*cell),
            resolution: u8::from(cell.resolution()),
        },
        TargetUnit::Area { .. } => EventFilter::WithinArea(unit),
    };
    let events = store.find_events(&filter)?;
    let homes = homes_of(store, params.method, &events)?;
    let counts = classify(unit, &events, &homes, params.neighbor_ring, params.frequency);
    Ok(ResultRecord::new(unit.id(), &counts)?)
}

fn cell_units<S: EventStore>(store: &S, resolution: u8) -> Result<Vec<SpatialUnit>, JobError> {
    Ok(store
        .cells_with_events(resolution)?
        .into_iter()
        .map(|cell| SpatialUnit::Cell { cell })
        .collect())
}

fn run_units<S>(
    store: &S,
    destination: &str,
    units: Vec<SpatialUnit>,
    params: &ResidencyParams,
    options: &JobOptions,
    progress: &dyn ProgressCallback,
) -> Result<JobReport, JobError>
where
    S: EventStore + ActorStore + ResultStore,
{
    let dest = ResultDestination::new(store, destination);
    let done = dest.completed_ids()?;
    let todo = remaining(&units, &done);
    log::info!(
        "Counting {todo} of {} units into {destination}",
        units.len()
    );
    progress.set_total(todo);

    run_chunked(
        &dest,
        pending(units, done),
        options,
        |unit: &SpatialUnit| -> Result<ResultRecord, Box<dyn Error>> {
            let target = TargetUnit::from_unit(unit)?;
            unit_counts(store, &target, params)
        },
        progress,
    )
}

/// Residency counts for every stored area unit.
///
/// # Errors
///
/// Returns [`JobError`] if the store fails or a unit's boundary does not
/// parse.
pub fn run_area_counts<S>(
    store: &S,
    destination: &str,
    params: &ResidencyParams,
    options: &JobOptions,
    progress: &dyn ProgressCallback,
) -> Result<JobReport, JobError>
where
    S: EventStore + ActorStore + UnitStore + ResultStore,
{
    let units = store.area_units()?;
    run_units(store, destination, units, params, options, progress)
}

/// Residency counts for every cell at `resolution` that has events.
///
/// # Errors
///
/// Returns [`JobError`] if the store fails.
pub fn run_cell_counts<S>(
    store: &S,
    destination: &str,
    resolution: u8,
    params: &ResidencyParams,
    options: &JobOptions,
    progress: &dyn ProgressCallback,
) -> Result<JobReport, JobError>
where
    S: EventStore + ActorStore + ResultStore,
{
    let units = cell_units(store, resolution)?;
    run_units(store, destination, units, params, options, progress)
}

/// Fills residency counts into a destination seeded with cell ids (see
/// [`crate::cells::seed_cells`]).
///
/// # Errors
///
/// Returns [`JobError`] if the store fails, a seeded id is not a valid
/// cell, or a round makes no progress.
pub fn run_cell_fill<S>(
    store: &S,
    destination: &str,
    params: &ResidencyParams,
    batch_size: usize,
    progress: &dyn ProgressCallback,
) -> Result<JobReport, JobError>
where
    S: EventStore + ActorStore + ResultStore,
{
    let dest = ResultDestination::new(store, destination);
    run_fill_missing(
        &dest,
        batch_size,
        |id: &str| -> Result<ResultRecord, Box<dyn Error>> {
            let raw = u64::from_str_radix(id, 16)?;
            let target = TargetUnit::Cell(cell_index(raw)?);
            unit_counts(store, &target, params)
        },
        progress,
    )
}

/// Which units to count residents for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSource {
    Areas,
    Cells { resolution: u8 },
}

/// Number of actors living in each unit.
///
/// Area totals attribute every complete home to its containing area
/// through an R-tree in one pass. Cell totals query the homes inside each
/// cell's bounding box and test them against the cell.
///
/// # Errors
///
/// Returns [`JobError`] if the store fails.
pub fn run_resident_totals<S>(
    store: &S,
    destination: &str,
    source: UnitSource,
    method: InferenceMethod,
    options: &JobOptions,
    progress: &dyn ProgressCallback,
) -> Result<JobReport, JobError>
where
    S: EventStore + ActorStore + UnitStore + ResultStore,
{
    let dest = ResultDestination::new(store, destination);
    let done = dest.completed_ids()?;

    match source {
        UnitSource::Areas => {
            let units = store.area_units()?;
            let index = UnitIndex::build(&units);
            let homes = store.find_homes(method, &HomeFilter::All)?;
            let per_area = index.count_points(
                homes
                    .iter()
                    .filter_map(|(_, c)| c.home_bucket().and_then(bucket_point)),
            );
            log::info!(
                "Attributed homes of {} actors to {} areas",
                homes.len(),
                per_area.len()
            );

            progress.set_total(remaining(&units, &done));
            run_chunked(
                &dest,
                pending(units, done),
                options,
                |unit: &SpatialUnit| {
                    let total = ResidentTotal {
                        totalusers: per_area.get(&unit.id()).copied().unwrap_or(0),
                    };
                    ResultRecord::new(unit.id(), &total)
                },
                progress,
            )
        }
        UnitSource::Cells { resolution } => {
            let units = cell_units(store, resolution)?;
            progress.set_total(remaining(&units, &done));
            run_chunked(
                &dest,
                pending(units, done),
                options,
                |unit: &SpatialUnit| -> Result<ResultRecord, Box<dyn Error>> {
                    let target = TargetUnit::from_unit(unit)?;
                    let homes = store.find_homes(method, &HomeFilter::WithinBox(target.bbox()))?;
                    let directory = HomeDirectory::from_classifications(
                        homes.iter().map(|(actor, c)| (*actor, c)),
                    );
                    Ok(ResultRecord::new(
                        target.id(),
                        &count_residents(&target, &directory),
                    )?)
                },
                progress,
            )
        }
    }
}
