//! The store boundary.
//!
//! Jobs receive a store value implementing these traits; nothing reaches
//! for a global connection.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use mobility_models::{ActorId, Classification, Event, InferenceMethod, SpatialUnit};
use mobility_spatial::{BoundingBox, TargetUnit};
use serde::{Deserialize, Serialize};

use crate::DbError;

/// Which events to load.
#[derive(Debug, Clone, Copy)]
pub enum EventFilter<'a> {
    /// Every event of one actor.
    Actor(ActorId),
    /// Events located inside a unit's geometry.
    WithinArea(&'a TargetUnit),
    /// Events whose precomputed cell at `resolution` equals `cell`.
    InCell { cell: u64, resolution: u8 },
    All,
}

/// Which actors' classifications to load.
#[derive(Debug, Clone, Copy)]
pub enum HomeFilter<'a> {
    Actors(&'a [ActorId]),
    /// Actors whose home center lies inside the box.
    WithinBox(BoundingBox),
    All,
}

/// New H3 cells for one event, keyed by resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpdate {
    pub event_id: i64,
    pub cells: BTreeMap<u8, u64>,
}

/// One committed job result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub target_id: String,
    pub payload: serde_json::Value,
}

impl ResultRecord {
    /// Serializes `value` as the record payload.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Json`] if `value` cannot be serialized.
    pub fn new<T: Serialize>(target_id: impl Into<String>, value: &T) -> Result<Self, DbError> {
        Ok(Self {
            target_id: target_id.into(),
            payload: serde_json::to_value(value)?,
        })
    }

    /// Deserializes the payload.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Json`] if the payload does not match `T`.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, DbError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// An item that could not be written in a non-atomic bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub target_id: String,
    pub message: String,
}

/// Outcome of a bulk write that keeps going past individual failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub written: u64,
    pub failures: Vec<ItemFailure>,
}

impl BatchReport {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Read and maintain geotagged events.
pub trait EventStore {
    /// Loads events matching `filter`, ordered by event id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    fn find_events(&self, filter: &EventFilter<'_>) -> Result<Vec<Event>, DbError>;

    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    fn count_events(&self, filter: &EventFilter<'_>) -> Result<u64, DbError>;

    /// Every actor with at least one event, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    fn distinct_actor_ids(&self) -> Result<Vec<ActorId>, DbError>;

    /// Distinct cells at `resolution` that have at least one event.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    fn cells_with_events(&self, resolution: u8) -> Result<Vec<u64>, DbError>;

    /// Up to `limit` located events, with id greater than `after_id`, that
    /// lack a cell at any of `resolutions`. Ordered by id for keyset
    /// pagination.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    fn events_missing_cells(
        &self,
        resolutions: &[u8],
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Event>, DbError>;

    /// Writes cells onto events. Items are independent: a failure is
    /// recorded in the report and the rest still apply.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] only if the store itself is unusable.
    fn update_event_cells(&self, updates: &[CellUpdate]) -> Result<BatchReport, DbError>;

    /// Inserts (or replaces) events together with their cells.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    fn insert_events(&self, events: &[Event]) -> Result<u64, DbError>;
}

/// Per-actor home/work classifications.
pub trait ActorStore {
    /// Classifications for `method` of the actors matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query or payload decoding fails.
    fn find_homes(
        &self,
        method: InferenceMethod,
        filter: &HomeFilter<'_>,
    ) -> Result<Vec<(ActorId, Classification)>, DbError>;

    /// Actors that already have a classification for `method`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    fn classified_actor_ids(&self, method: InferenceMethod) -> Result<BTreeSet<ActorId>, DbError>;

    /// Writes (or overwrites) one actor's classification for `method`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    fn upsert_classification(
        &self,
        actor_id: ActorId,
        method: InferenceMethod,
        classification: &Classification,
    ) -> Result<(), DbError>;

    /// Inserts a batch atomically: all rows land or none do.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::BatchRejected`] naming the first actor that could
    /// not be written (e.g. already classified).
    fn insert_classifications(
        &self,
        method: InferenceMethod,
        batch: &[(ActorId, Classification)],
    ) -> Result<u64, DbError>;
}

/// Polygon aggregation units.
pub trait UnitStore {
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    fn area_units(&self) -> Result<Vec<SpatialUnit>, DbError>;

    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    fn insert_units(&self, units: &[SpatialUnit]) -> Result<u64, DbError>;
}

/// Named result destinations, one row per target.
///
/// A destination that was never written to behaves as empty.
pub trait ResultStore {
    /// Targets with a committed payload.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or the name is invalid.
    fn completed_ids(&self, destination: &str) -> Result<BTreeSet<String>, DbError>;

    /// Inserts a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::BatchRejected`] naming the failing target; nothing
    /// from the batch is kept.
    fn insert_results(&self, destination: &str, records: &[ResultRecord]) -> Result<u64, DbError>;

    /// Creates placeholder rows (no payload) for targets that do not exist
    /// yet.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    fn seed_targets(&self, destination: &str, target_ids: &[String]) -> Result<u64, DbError>;

    /// Up to `limit` placeholder targets still missing a payload.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    fn missing_result_ids(&self, destination: &str, limit: usize)
    -> Result<Vec<String>, DbError>;

    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    fn count_missing(&self, destination: &str) -> Result<u64, DbError>;

    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    fn upsert_result(&self, destination: &str, record: &ResultRecord) -> Result<(), DbError>;

    /// Every committed record, ordered by target id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query or payload decoding fails.
    fn all_results(&self, destination: &str) -> Result<Vec<ResultRecord>, DbError>;

    /// Claims as many of `target_ids` as are free (or already held by
    /// `worker`) until `ttl` from now. Returns the ids now held by `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the claim transaction fails.
    fn try_claim(
        &self,
        destination: &str,
        target_ids: &[String],
        worker: &str,
        ttl: Duration,
    ) -> Result<Vec<String>, DbError>;

    /// Drops every claim `worker` holds on `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the delete fails.
    fn release_claims(&self, destination: &str, worker: &str) -> Result<u64, DbError>;
}
