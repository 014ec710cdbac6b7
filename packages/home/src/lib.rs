#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Home and work location inference.
//!
//! Given every event one actor produced, quantize the locations into
//! spatial buckets and score each frequently used bucket by how much of
//! its activity happens at night and on weekends. The most "night and
//! weekend" bucket is home; of the rest, the most "daytime and weekday"
//! bucket is work.

pub mod stats;

use mobility_models::{
    Classification, Event, HomeWork, IncompleteReason, InferenceMethod, LocationStats,
    SpatialBucket,
};
use serde::{Deserialize, Serialize};

pub use stats::{Observation, bucket_for};

/// Tunables for [`infer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Minimum number of bucketable events an actor needs.
    pub min_events: usize,
    /// A bucket is a candidate when `freq / max_freq` exceeds this.
    pub candidate_ratio: f64,
    /// Hours strictly before this are night.
    pub night_before_hour: u32,
    /// Hours strictly after this are night.
    pub night_after_hour: u32,
    /// Offset applied to event timestamps before deriving hour and weekday.
    pub utc_offset_seconds: i32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            min_events: 30,
            candidate_ratio: 0.1,
            night_before_hour: 7,
            night_after_hour: 22,
            utc_offset_seconds: 0,
        }
    }
}

/// Full per-bucket statistics table for an actor, busiest bucket first.
#[must_use]
pub fn frequency_table(
    events: &[Event],
    method: InferenceMethod,
    config: &InferenceConfig,
) -> Vec<LocationStats> {
    stats::summarize(&stats::observe(events, method, config))
}

/// The events that fall in `bucket` under `method`.
#[must_use]
pub fn events_at<'a>(
    events: &'a [Event],
    bucket: &SpatialBucket,
    method: InferenceMethod,
) -> Vec<&'a Event> {
    events
        .iter()
        .filter(|e| bucket_for(e, method).as_ref() == Some(bucket))
        .collect()
}

/// Infers home and work for one actor's events.
///
/// Insufficient history and a missing work candidate are reported as
/// [`Classification::Incomplete`], never as errors.
#[must_use]
pub fn infer(events: &[Event], method: InferenceMethod, config: &InferenceConfig) -> Classification {
    let observations = stats::observe(events, method, config);
    if observations.len() < config.min_events {
        return Classification::incomplete(IncompleteReason::InsufficientData);
    }

    let candidates: Vec<LocationStats> = stats::summarize(&observations)
        .into_iter()
        .filter(|s| s.freq_ratio > config.candidate_ratio)
        .collect();

    let Some(home_idx) = first_max(&candidates, LocationStats::home_score) else {
        return Classification::incomplete(IncompleteReason::InsufficientData);
    };

    let mut remaining = candidates;
    let home = remaining.remove(home_idx);

    let Some(work_idx) = first_max(&remaining, LocationStats::work_score) else {
        log::debug!("Home found at {} but no work candidate remains", home.bucket);
        return Classification::incomplete(IncompleteReason::NoWorkLocation);
    };
    let work = remaining.swap_remove(work_idx);

    Classification::Complete(HomeWork { home, work, method })
}

/// Index of the highest-scoring entry; the earliest wins ties.
fn first_max(table: &[LocationStats], score: impl Fn(&LocationStats) -> f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, stats) in table.iter().enumerate() {
        let s = score(stats);
        if best.is_none_or(|(_, b)| s > b) {
            best = Some((i, s));
        }
    }
    best.map(|(i, _)| i)
}
