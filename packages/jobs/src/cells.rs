//! H3 cell maintenance: backfilling event cells and seeding cell targets.

use std::collections::BTreeMap;
use std::time::Instant;

use mobility_database::{BatchReport, CellUpdate, EventStore, ItemFailure, ResultStore};
use mobility_models::Event;
use mobility_spatial::{cell_at, resolution};

use crate::JobError;
use crate::progress::ProgressCallback;

/// Default number of events fetched per backfill batch.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Outcome of [`assign_cells`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellReport {
    /// Events that received at least one new cell.
    pub assigned: u64,
    pub batches: u64,
    /// Events whose cells could not be computed or written.
    pub failures: Vec<ItemFailure>,
}

/// Cells missing from `event` at `resolutions`, or the reason they cannot
/// be computed.
fn missing_cells(event: &Event, resolutions: &[u8]) -> Result<CellUpdate, String> {
    let location = event
        .location
        .ok_or_else(|| "event has no location".to_string())?;

    let mut cells = BTreeMap::new();
    for &res in resolutions {
        if event.cell(res).is_some() {
            continue;
        }
        let cell = cell_at(location, res).map_err(|e| e.to_string())?;
        cells.insert(res, u64::from(cell));
    }

    Ok(CellUpdate {
        event_id: event.id,
        cells,
    })
}

/// Computes and stores the cells every located event is missing at
/// `resolutions`.
///
/// Events are walked by id in batches of `batch_size`, so an event that
/// fails is reported once and never re-fetched. Failures do not stop the
/// run.
///
/// # Errors
///
/// Returns [`JobError`] if a resolution is invalid or the store fails.
pub fn assign_cells<S: EventStore>(
    store: &S,
    resolutions: &[u8],
    batch_size: usize,
    progress: &dyn ProgressCallback,
) -> Result<CellReport, JobError> {
    for &res in resolutions {
        resolution(res)?;
    }

    let start = Instant::now();
    let batch_size = batch_size.max(1);
    let mut report = CellReport::default();
    let mut after = None;

    loop {
        let events = store.events_missing_cells(resolutions, after, batch_size)?;
        let Some(last) = events.last() else {
            break;
        };
        after = Some(last.id);

        let mut updates = Vec::with_capacity(events.len());
        for event in &events {
            match missing_cells(event, resolutions) {
                Ok(update) => updates.push(update),
                Err(message) => report.failures.push(ItemFailure {
                    target_id: event.id.to_string(),
                    message,
                }),
            }
        }

        let BatchReport { written, failures } = store.update_event_cells(&updates)?;
        report.assigned += written;
        report.failures.extend(failures);
        report.batches += 1;

        progress.inc(events.len() as u64);
        log::info!(
            "Batch {}: assigned cells to {written} of {} events",
            report.batches,
            events.len()
        );
    }

    for failure in &report.failures {
        log::error!(
            "Event {}: cell assignment failed: {}",
            failure.target_id,
            failure.message
        );
    }
    log::info!(
        "Assigned cells to {} events in {:.1}s ({} failures)",
        report.assigned,
        start.elapsed().as_secs_f64(),
        report.failures.len()
    );
    progress.finish(format!("assigned cells to {} events", report.assigned));

    Ok(report)
}

/// Seeds `destination` with a placeholder for every cell at `resolution`
/// that has events, ready for the in-place fill mode.
///
/// Returns the number of new placeholders.
///
/// # Errors
///
/// Returns [`JobError`] if the resolution is invalid or the store fails.
pub fn seed_cells<S: EventStore + ResultStore>(
    store: &S,
    destination: &str,
    res: u8,
) -> Result<u64, JobError> {
    resolution(res)?;
    let ids: Vec<String> = store
        .cells_with_events(res)?
        .into_iter()
        .map(|cell| format!("{cell:x}"))
        .collect();
    let seeded = store.seed_targets(destination, &ids)?;
    log::info!(
        "Seeded {seeded} new of {} cells into {destination}",
        ids.len()
    );
    Ok(seeded)
}
