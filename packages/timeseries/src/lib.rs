#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Calendar-bucketed event counts.
//!
//! Buckets are anchored to the calendar (ISO week, month, quarter, year
//! boundaries), never to the first timestamp in the data, so counts for
//! different units line up. Output is sparse: a bucket with no events is
//! absent, not zero.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use mobility_models::{BucketCounts, BucketFrequency, Category, Event, ResidencyCounts};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// Returns the first calendar day of the bucket containing `ts`.
#[must_use]
pub fn bucket_start(ts: DateTime<Utc>, frequency: BucketFrequency) -> NaiveDate {
    let date = ts.date_naive();
    match frequency {
        BucketFrequency::Daily => date,
        BucketFrequency::Weekly => date
            .checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))
            .unwrap_or(date),
        BucketFrequency::Monthly => first_of(date.year(), date.month()).unwrap_or(date),
        BucketFrequency::Quarterly => {
            let quarter_month = (date.month() - 1) / 3 * 3 + 1;
            first_of(date.year(), quarter_month).unwrap_or(date)
        }
        BucketFrequency::Yearly => first_of(date.year(), 1).unwrap_or(date),
    }
}

fn first_of(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Counts timestamps per calendar bucket.
///
/// An empty input yields an empty map.
#[must_use]
pub fn aggregate<I>(timestamps: I, frequency: BucketFrequency) -> BucketCounts
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    let mut counts = BucketCounts::new();
    for ts in timestamps {
        *counts.entry(bucket_start(ts, frequency)).or_insert(0) += 1;
    }
    counts
}

/// Counts events per calendar bucket of their creation time.
#[must_use]
pub fn aggregate_events<'a, I>(events: I, frequency: BucketFrequency) -> BucketCounts
where
    I: IntoIterator<Item = &'a Event>,
{
    aggregate(events.into_iter().map(|e| e.created_at), frequency)
}

/// Aggregates `timestamps` and stores the result under `category`,
/// replacing whatever that category held.
pub fn aggregate_labeled<I>(
    counts: &mut ResidencyCounts,
    category: Category,
    timestamps: I,
    frequency: BucketFrequency,
) where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    let series = aggregate(timestamps, frequency);
    match category {
        Category::TotalCounts => counts.totalcounts = series,
        Category::Residents => counts.residents = series,
        Category::NonResidents => counts.nonresidents = series,
        Category::NonResidentsAndNonNeighbors => counts.nonresidentsandnonneighbors = series,
    }
}

/// Outer-joins two sparse series on bucket key.
///
/// A bucket present on only one side is `None` on the other; absence is
/// never turned into zero.
#[must_use]
pub fn outer_join(
    left: &BucketCounts,
    right: &BucketCounts,
) -> BTreeMap<NaiveDate, (Option<u64>, Option<u64>)> {
    let mut joined: BTreeMap<NaiveDate, (Option<u64>, Option<u64>)> = BTreeMap::new();
    for (bucket, count) in left {
        joined.entry(*bucket).or_default().0 = Some(*count);
    }
    for (bucket, count) in right {
        joined.entry(*bucket).or_default().1 = Some(*count);
    }
    joined
}

/// One value per category for a single bucket; `None` means the category
/// had no entry for that bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryValues {
    pub totalcounts: Option<u64>,
    pub residents: Option<u64>,
    pub nonresidents: Option<u64>,
    pub nonresidentsandnonneighbors: Option<u64>,
}

impl CategoryValues {
    #[must_use]
    pub const fn get(&self, category: Category) -> Option<u64> {
        match category {
            Category::TotalCounts => self.totalcounts,
            Category::Residents => self.residents,
            Category::NonResidents => self.nonresidents,
            Category::NonResidentsAndNonNeighbors => self.nonresidentsandnonneighbors,
        }
    }

    const fn slot(&mut self, category: Category) -> &mut Option<u64> {
        match category {
            Category::TotalCounts => &mut self.totalcounts,
            Category::Residents => &mut self.residents,
            Category::NonResidents => &mut self.nonresidents,
            Category::NonResidentsAndNonNeighbors => &mut self.nonresidentsandnonneighbors,
        }
    }
}

/// A single (target, bucket) row of the long-format panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelRow {
    pub target_id: String,
    pub bucket: NaiveDate,
    pub values: CategoryValues,
}

/// Flattens one unit's [`ResidencyCounts`] into panel rows, outer-joining
/// all four categories on bucket key.
#[must_use]
pub fn flatten_counts(target_id: &str, counts: &ResidencyCounts) -> Vec<PanelRow> {
    let mut by_bucket: BTreeMap<NaiveDate, CategoryValues> = BTreeMap::new();
    for category in Category::iter() {
        for (bucket, count) in counts.get(category) {
            *by_bucket.entry(*bucket).or_default().slot(category) = Some(*count);
        }
    }
    by_bucket
        .into_iter()
        .map(|(bucket, values)| PanelRow {
            target_id: target_id.to_string(),
            bucket,
            values,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn quarterly_buckets_are_sparse() {
        let counts = aggregate(
            vec![ts(2013, 1, 5), ts(2013, 3, 31), ts(2013, 8, 14)],
            BucketFrequency::Quarterly,
        );
        assert_eq!(counts.len(), 2);
        assert_eq!(counts.get(&date(2013, 1, 1)), Some(&2));
        assert_eq!(counts.get(&date(2013, 7, 1)), Some(&1));
        assert!(!counts.contains_key(&date(2013, 4, 1)));
    }

    #[test]
    fn empty_input_yields_empty_map() {
        assert!(aggregate(Vec::new(), BucketFrequency::Monthly).is_empty());
    }

    #[test]
    fn weekly_buckets_start_on_monday() {
        // 2014-03-09 is a Sunday.
        assert_eq!(
            bucket_start(ts(2014, 3, 9), BucketFrequency::Weekly),
            date(2014, 3, 3)
        );
        assert_eq!(
            bucket_start(ts(2014, 3, 10), BucketFrequency::Weekly),
            date(2014, 3, 10)
        );
    }

    #[test]
    fn buckets_are_calendar_anchored() {
        assert_eq!(
            bucket_start(ts(2015, 12, 31), BucketFrequency::Quarterly),
            date(2015, 10, 1)
        );
        assert_eq!(
            bucket_start(ts(2015, 12, 31), BucketFrequency::Yearly),
            date(2015, 1, 1)
        );
        assert_eq!(
            bucket_start(ts(2015, 2, 17), BucketFrequency::Monthly),
            date(2015, 2, 1)
        );
    }

    #[test]
    fn outer_join_keeps_missing_side_absent() {
        let left = aggregate(vec![ts(2013, 1, 5)], BucketFrequency::Quarterly);
        let right = aggregate(vec![ts(2013, 5, 5)], BucketFrequency::Quarterly);
        let joined = outer_join(&left, &right);
        assert_eq!(joined[&date(2013, 1, 1)], (Some(1), None));
        assert_eq!(joined[&date(2013, 4, 1)], (None, Some(1)));
    }

    #[test]
    fn flatten_counts_outer_joins_categories() {
        let mut counts = ResidencyCounts::default();
        aggregate_labeled(
            &mut counts,
            Category::TotalCounts,
            vec![ts(2013, 1, 5), ts(2013, 5, 5)],
            BucketFrequency::Quarterly,
        );
        aggregate_labeled(
            &mut counts,
            Category::Residents,
            vec![ts(2013, 5, 6)],
            BucketFrequency::Quarterly,
        );

        let rows = flatten_counts("a", &counts);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bucket, date(2013, 1, 1));
        assert_eq!(rows[0].values.totalcounts, Some(1));
        assert_eq!(rows[0].values.residents, None);
        assert_eq!(rows[1].values.residents, Some(1));
        assert_eq!(rows[1].values.nonresidents, None);
    }
}
