//! Per-event features and per-bucket statistics.

use std::collections::BTreeMap;

use chrono::{Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};
use mobility_models::{Event, InferenceMethod, LocationStats, SpatialBucket};

use crate::InferenceConfig;

/// The features of one event that the heuristics use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub bucket: SpatialBucket,
    pub hour: u32,
    pub is_night: bool,
    pub is_weekend: bool,
}

/// Spatial bucket for an event under `method`, or `None` if the event has
/// neither the precomputed cell nor coordinates to derive it from.
#[must_use]
pub fn bucket_for(event: &Event, method: InferenceMethod) -> Option<SpatialBucket> {
    match method {
        InferenceMethod::LatLon => event.location.map(SpatialBucket::rounded),
        InferenceMethod::GridCell { resolution } => event
            .cell(resolution)
            .or_else(|| {
                let location = event.location?;
                mobility_spatial::cell_at(location, resolution)
                    .ok()
                    .map(u64::from)
            })
            .map(|cell| SpatialBucket::Cell { cell }),
    }
}

fn local_offset(config: &InferenceConfig) -> FixedOffset {
    FixedOffset::east_opt(config.utc_offset_seconds).unwrap_or_else(|| Utc.fix())
}

/// Derives the hour/night/weekend features of each bucketable event.
#[must_use]
pub fn observe(
    events: &[Event],
    method: InferenceMethod,
    config: &InferenceConfig,
) -> Vec<Observation> {
    let offset = local_offset(config);
    let mut observations = Vec::with_capacity(events.len());

    for event in events {
        let Some(bucket) = bucket_for(event, method) else {
            log::debug!(
                "Event {} of actor {} has no location for {method}, skipping",
                event.id,
                event.actor_id
            );
            continue;
        };
        let local = event.created_at.with_timezone(&offset);
        let hour = local.hour();
        observations.push(Observation {
            bucket,
            hour,
            is_night: hour < config.night_before_hour || hour > config.night_after_hour,
            is_weekend: matches!(local.weekday(), Weekday::Sat | Weekday::Sun),
        });
    }

    observations
}

#[derive(Debug, Default, Clone, Copy)]
struct HourSummary {
    freq: u64,
    hours_seen: u32,
    min_hour: u32,
    max_hour: u32,
}

/// Builds the per-bucket statistics table, ordered by descending
/// frequency with ties in ascending bucket order.
///
/// Frequency and hour statistics come from one pass; night and weekend
/// counts are reduced independently and joined by bucket, with buckets
/// that have no night (or weekend) events getting an explicit 0.
#[must_use]
pub fn summarize(observations: &[Observation]) -> Vec<LocationStats> {
    let mut summaries: BTreeMap<SpatialBucket, HourSummary> = BTreeMap::new();
    for obs in observations {
        let s = summaries.entry(obs.bucket).or_insert(HourSummary {
            min_hour: obs.hour,
            max_hour: obs.hour,
            ..HourSummary::default()
        });
        s.freq += 1;
        s.hours_seen |= 1 << obs.hour;
        s.min_hour = s.min_hour.min(obs.hour);
        s.max_hour = s.max_hour.max(obs.hour);
    }

    let night = count_where(observations, |o| o.is_night);
    let weekend = count_where(observations, |o| o.is_weekend);

    let max_freq = summaries.values().map(|s| s.freq).max().unwrap_or(0);

    let mut table: Vec<LocationStats> = summaries
        .into_iter()
        .map(|(bucket, s)| {
            #[allow(clippy::cast_precision_loss)]
            let freq_ratio = if max_freq == 0 {
                0.0
            } else {
                s.freq as f64 / max_freq as f64
            };
            LocationStats {
                bucket,
                freq: s.freq,
                unique_hours: s.hours_seen.count_ones(),
                hour_range: s.max_hour - s.min_hour,
                night_freq: night.get(&bucket).copied().unwrap_or(0),
                weekend_freq: weekend.get(&bucket).copied().unwrap_or(0),
                freq_ratio,
            }
        })
        .collect();

    table.sort_by(|a, b| b.freq.cmp(&a.freq));
    table
}

fn count_where(
    observations: &[Observation],
    predicate: impl Fn(&Observation) -> bool,
) -> BTreeMap<SpatialBucket, u64> {
    let mut counts = BTreeMap::new();
    for obs in observations.iter().filter(|o| predicate(o)) {
        *counts.entry(obs.bucket).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use mobility_models::Coordinates;

    use super::*;

    fn event(hour: u32, day: u32, lon: f64) -> Event {
        Event {
            id: 0,
            actor_id: 1,
            created_at: Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap(),
            location: Some(Coordinates::new(lon, -34.60)),
            cells: BTreeMap::new(),
        }
    }

    #[test]
    fn night_boundaries_are_exclusive_of_7_and_22() {
        let config = InferenceConfig::default();
        let obs = observe(
            &[event(6, 2, -58.4), event(7, 2, -58.4), event(22, 2, -58.4), event(23, 2, -58.4)],
            InferenceMethod::LatLon,
            &config,
        );
        let nights: Vec<bool> = obs.iter().map(|o| o.is_night).collect();
        assert_eq!(nights, vec![true, false, false, true]);
    }

    #[test]
    fn weekend_is_saturday_and_sunday() {
        // 2024-01-05 is a Friday.
        let obs = observe(
            &[event(12, 5, -58.4), event(12, 6, -58.4), event(12, 7, -58.4)],
            InferenceMethod::LatLon,
            &InferenceConfig::default(),
        );
        let weekends: Vec<bool> = obs.iter().map(|o| o.is_weekend).collect();
        assert_eq!(weekends, vec![false, true, true]);
    }

    #[test]
    fn utc_offset_shifts_local_hour() {
        let config = InferenceConfig {
            utc_offset_seconds: -3 * 3600,
            ..InferenceConfig::default()
        };
        let obs = observe(&[event(2, 3, -58.4)], InferenceMethod::LatLon, &config);
        assert_eq!(obs[0].hour, 23);
        assert!(obs[0].is_night);
    }

    #[test]
    fn table_defaults_missing_night_and_weekend_to_zero() {
        let obs = observe(
            &[event(12, 2, -58.4), event(13, 2, -58.4), event(23, 6, -58.3)],
            InferenceMethod::LatLon,
            &InferenceConfig::default(),
        );
        let table = summarize(&obs);
        assert_eq!(table.len(), 2);

        let top = &table[0];
        assert_eq!(top.freq, 2);
        assert_eq!(top.night_freq, 0);
        assert_eq!(top.weekend_freq, 0);
        assert_eq!(top.unique_hours, 2);
        assert_eq!(top.hour_range, 1);
        assert!((top.freq_ratio - 1.0).abs() < f64::EPSILON);

        let other = &table[1];
        assert_eq!(other.night_freq, 1);
        assert_eq!(other.weekend_freq, 1);
        assert!((other.freq_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn events_without_location_are_skipped() {
        let mut no_location = event(12, 2, -58.4);
        no_location.location = None;
        let obs = observe(
            &[no_location, event(12, 2, -58.4)],
            InferenceMethod::GridCell { resolution: 9 },
            &InferenceConfig::default(),
        );
        assert_eq!(obs.len(), 1);
        assert!(matches!(obs[0].bucket, SpatialBucket::Cell { .. }));
    }

    #[test]
    fn grid_method_prefers_precomputed_cell() {
        let e = event(12, 2, -58.4).with_cell(9, 0x089d_d687_6033_ffff);
        assert_eq!(
            bucket_for(&e, InferenceMethod::GridCell { resolution: 9 }),
            Some(SpatialBucket::Cell {
                cell: 0x089d_d687_6033_ffff
            })
        );
    }
}
