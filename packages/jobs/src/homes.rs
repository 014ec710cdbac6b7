//! Home/work inference over every actor with events.

use mobility_database::{ActorStore, EventFilter, EventStore};
use mobility_home::{InferenceConfig, infer};
use mobility_models::{ActorId, InferenceMethod};

use crate::engine::{ClassificationDestination, Destination, JobOptions, JobReport, run_chunked};
use crate::pending::{pending, remaining};
use crate::progress::ProgressCallback;
use crate::JobError;

/// Classifies every actor that has no classification for `method` yet.
///
/// # Errors
///
/// Returns [`JobError`] if the store fails; chunks committed before the
/// failure are kept and skipped on the next run.
pub fn run<S>(
    store: &S,
    method: InferenceMethod,
    config: &InferenceConfig,
    options: &JobOptions,
    progress: &dyn ProgressCallback,
) -> Result<JobReport, JobError>
where
    S: EventStore + ActorStore,
{
    let destination = ClassificationDestination::new(store, method);
    let actors = store.distinct_actor_ids()?;
    let done = destination.completed_ids()?;

    let todo = remaining(&actors, &done);
    log::info!(
        "Inferring {method} homes for {todo} of {} actors",
        actors.len()
    );
    progress.set_total(todo);

    run_chunked(
        &destination,
        pending(actors, done),
        options,
        |actor: &ActorId| {
            let events = store.find_events(&EventFilter::Actor(*actor))?;
            let classification = infer(&events, method, config);
            log::debug!(
                "Actor {actor}: {} events, complete={}",
                events.len(),
                classification.is_complete()
            );
            Ok::<_, mobility_database::DbError>((*actor, classification))
        },
        progress,
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use mobility_database::{DuckDbStore, HomeFilter};
    use mobility_models::{Classification, Coordinates, Event, IncompleteReason, SpatialBucket};

    use super::*;
    use crate::progress::NullProgress;

    fn event(id: i64, actor_id: ActorId, place: Coordinates, day: u32, hour: u32) -> Event {
        Event {
            id,
            actor_id,
            created_at: Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap(),
            location: Some(place),
            cells: BTreeMap::new(),
        }
    }

    fn store() -> DuckDbStore {
        let home = Coordinates::new(-58.46, -34.63);
        let work = Coordinates::new(-58.38, -34.60);

        let mut events = Vec::new();
        let mut id = 0;
        let mut push = |actor, place, day, hour, n| {
            for _ in 0..n {
                id += 1;
                events.push(event(id, actor, place, day, hour));
            }
        };
        // Actor 1: nights and weekends at home, weekdays at work.
        push(1, home, 6, 23, 30);
        push(1, work, 2, 12, 10);
        // Actor 2: too little history.
        push(2, home, 2, 12, 5);

        let store = DuckDbStore::open_in_memory().unwrap();
        store.insert_events(&events).unwrap();
        store
    }

    #[test]
    fn classifies_every_actor_once() {
        let store = store();
        let method = InferenceMethod::LatLon;
        let report = run(
            &store,
            method,
            &InferenceConfig::default(),
            &JobOptions::default(),
            &NullProgress,
        )
        .unwrap();
        assert_eq!(report.committed, 2);

        let homes: BTreeMap<ActorId, Classification> = store
            .find_homes(method, &HomeFilter::All)
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(
            homes[&1].home_bucket(),
            Some(&SpatialBucket::rounded(Coordinates::new(-58.46, -34.63)))
        );
        assert_eq!(
            homes[&2],
            Classification::incomplete(IncompleteReason::InsufficientData)
        );

        let rerun = run(
            &store,
            method,
            &InferenceConfig::default(),
            &JobOptions::default(),
            &NullProgress,
        )
        .unwrap();
        assert_eq!(rerun.committed, 0);
    }

    #[test]
    fn methods_are_tracked_separately() {
        let store = store();
        run(
            &store,
            InferenceMethod::LatLon,
            &InferenceConfig::default(),
            &JobOptions::default(),
            &NullProgress,
        )
        .unwrap();
        let report = run(
            &store,
            InferenceMethod::GridCell { resolution: 9 },
            &InferenceConfig::default(),
            &JobOptions::default(),
            &NullProgress,
        )
        .unwrap();
        assert_eq!(report.committed, 2);
    }
}
