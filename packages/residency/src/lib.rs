#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Spatial residency classification.
//!
//! The events observed inside a unit are split by where their author
//! lives: residents have their inferred home inside the unit, neighbors
//! live in the ring of cells at distance `k` around it, and everyone else
//! (including actors without a complete inference) is an outsider.

use std::collections::{BTreeMap, BTreeSet};

use mobility_models::{
    ActorId, BucketFrequency, Classification, Event, ResidencyCounts, ResidentTotal,
    SpatialBucket,
};
use mobility_spatial::{TargetUnit, bucket_cell, ring};
use mobility_timeseries::aggregate_events;

/// Home bucket per actor, for actors whose inference completed.
#[derive(Debug, Clone, Default)]
pub struct HomeDirectory {
    homes: BTreeMap<ActorId, SpatialBucket>,
}

impl HomeDirectory {
    /// Builds the directory from per-actor classifications. Incomplete
    /// classifications are left out, so those actors have no home.
    #[must_use]
    pub fn from_classifications<'a, I>(classifications: I) -> Self
    where
        I: IntoIterator<Item = (ActorId, &'a Classification)>,
    {
        let homes = classifications
            .into_iter()
            .filter_map(|(actor, c)| c.home_bucket().map(|home| (actor, *home)))
            .collect();
        Self { homes }
    }

    #[must_use]
    pub fn home(&self, actor: ActorId) -> Option<&SpatialBucket> {
        self.homes.get(&actor)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.homes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.homes.is_empty()
    }

    pub fn buckets(&self) -> impl Iterator<Item = &SpatialBucket> {
        self.homes.values()
    }
}

impl FromIterator<(ActorId, SpatialBucket)> for HomeDirectory {
    fn from_iter<T: IntoIterator<Item = (ActorId, SpatialBucket)>>(iter: T) -> Self {
        Self {
            homes: iter.into_iter().collect(),
        }
    }
}

/// Where an event's author lives relative to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Resident,
    Neighbor,
    Outsider,
}

/// A target unit together with its neighbor ring.
#[derive(Debug, Clone)]
pub struct Neighborhood {
    unit: TargetUnit,
    ring: BTreeSet<u64>,
}

impl Neighborhood {
    /// Cell units get the cells at exactly distance `k`. Area units have
    /// no grid neighbors, so their ring is empty.
    #[must_use]
    pub fn new(unit: TargetUnit, k: u32) -> Self {
        let ring = match &unit {
            TargetUnit::Cell(cell) => ring(*cell, k),
            TargetUnit::Area { .. } => BTreeSet::new(),
        };
        Self { unit, ring }
    }

    #[must_use]
    pub const fn unit(&self) -> &TargetUnit {
        &self.unit
    }

    #[must_use]
    pub fn residency(&self, home: Option<&SpatialBucket>) -> Residency {
        let Some(home) = home else {
            return Residency::Outsider;
        };
        if self.unit.contains_bucket(home) {
            return Residency::Resident;
        }
        if let TargetUnit::Cell(cell) = &self.unit
            && bucket_cell(home, cell.resolution())
                .is_some_and(|c| self.ring.contains(&u64::from(c)))
        {
            return Residency::Neighbor;
        }
        Residency::Outsider
    }
}

/// The events of a unit split by residency. Every event is in `all`;
/// `residents` and `nonresidents` partition it, and
/// `nonresidents_and_nonneighbors` is a subset of `nonresidents`.
#[derive(Debug, Default)]
pub struct Partition<'a> {
    pub all: Vec<&'a Event>,
    pub residents: Vec<&'a Event>,
    pub nonresidents: Vec<&'a Event>,
    pub nonresidents_and_nonneighbors: Vec<&'a Event>,
}

#[must_use]
pub fn partition<'a>(
    neighborhood: &Neighborhood,
    events: &'a [Event],
    homes: &HomeDirectory,
) -> Partition<'a> {
    let mut partition = Partition::default();
    for event in events {
        partition.all.push(event);
        match neighborhood.residency(homes.home(event.actor_id)) {
            Residency::Resident => partition.residents.push(event),
            Residency::Neighbor => partition.nonresidents.push(event),
            Residency::Outsider => {
                partition.nonresidents.push(event);
                partition.nonresidents_and_nonneighbors.push(event);
            }
        }
    }
    partition
}

/// Splits the unit's events by residency and buckets each group in time.
///
/// All four categories are always populated, with empty maps for empty
/// groups.
#[must_use]
pub fn classify(
    unit: &TargetUnit,
    events: &[Event],
    homes: &HomeDirectory,
    k: u32,
    frequency: BucketFrequency,
) -> ResidencyCounts {
    let neighborhood = Neighborhood::new(unit.clone(), k);
    let p = partition(&neighborhood, events, homes);

    log::debug!(
        "Unit {}: {} events, {} from residents, {} from outsiders",
        unit.id(),
        p.all.len(),
        p.residents.len(),
        p.nonresidents_and_nonneighbors.len()
    );

    ResidencyCounts {
        totalcounts: aggregate_events(p.all, frequency),
        residents: aggregate_events(p.residents, frequency),
        nonresidents: aggregate_events(p.nonresidents, frequency),
        nonresidentsandnonneighbors: aggregate_events(p.nonresidents_and_nonneighbors, frequency),
    }
}

/// Number of actors whose home lies inside `unit`.
#[must_use]
pub fn count_residents(unit: &TargetUnit, homes: &HomeDirectory) -> ResidentTotal {
    ResidentTotal {
        totalusers: homes.buckets().filter(|b| unit.contains_bucket(b)).count() as u64,
    }
}
