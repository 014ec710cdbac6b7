#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared data model for mobility panels.
//!
//! Events are immutable geotagged posts made by an actor. Actors carry the
//! home/work [`Classification`] produced for each inference method. Spatial
//! units are the aggregation targets: either an arbitrary polygon or an H3
//! cell. [`ResidencyCounts`] is the committed per-unit result: four sparse
//! calendar-bucket count maps, one per [`Category`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Identifier of the actor (account) that produced an event.
pub type ActorId = i64;

/// Sparse mapping from calendar-bucket start date to event count.
///
/// Only buckets with at least one event are present. Keys serialize as
/// `YYYY-MM-DD`, which sorts chronologically.
pub type BucketCounts = BTreeMap<NaiveDate, u64>;

/// A WGS84 longitude/latitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Longitude in degrees.
    pub lon: f64,
    /// Latitude in degrees.
    pub lat: f64,
}

impl Coordinates {
    #[must_use]
    pub const fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

/// A single geotagged, timestamped event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Store-assigned record id.
    pub id: i64,
    /// The actor that produced the event.
    pub actor_id: ActorId,
    /// When the event was created.
    pub created_at: DateTime<Utc>,
    /// Point location, if the event carries raw coordinates.
    pub location: Option<Coordinates>,
    /// Precomputed H3 cells keyed by resolution (raw `u64` H3 index).
    #[serde(default)]
    pub cells: BTreeMap<u8, u64>,
}

impl Event {
    /// Builds an event from an epoch-milliseconds timestamp.
    ///
    /// Returns `None` if the timestamp is out of range.
    #[must_use]
    pub fn from_epoch_millis(
        id: i64,
        actor_id: ActorId,
        created_at_ms: i64,
        location: Option<Coordinates>,
    ) -> Option<Self> {
        Some(Self {
            id,
            actor_id,
            created_at: DateTime::from_timestamp_millis(created_at_ms)?,
            location,
            cells: BTreeMap::new(),
        })
    }

    /// Returns a copy of this event with an H3 cell attached at `resolution`.
    #[must_use]
    pub fn with_cell(mut self, resolution: u8, cell: u64) -> Self {
        self.cells.insert(resolution, cell);
        self
    }

    /// Returns the precomputed cell at `resolution`, if any.
    #[must_use]
    pub fn cell(&self, resolution: u8) -> Option<u64> {
        self.cells.get(&resolution).copied()
    }
}

/// The spatial key a home or work location is expressed in.
///
/// Lat/lon buckets store hundredths of a degree so the key is totally
/// ordered and hashes exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpatialBucket {
    /// Coordinates rounded to two decimal digits.
    LatLon {
        /// Latitude in hundredths of a degree.
        lat_e2: i32,
        /// Longitude in hundredths of a degree.
        lon_e2: i32,
    },
    /// A raw H3 cell index.
    Cell {
        /// Raw `u64` H3 index.
        cell: u64,
    },
}

impl SpatialBucket {
    /// Rounds a coordinate pair to the two-decimal lat/lon grid.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn rounded(coordinates: Coordinates) -> Self {
        Self::LatLon {
            lat_e2: (coordinates.lat * 100.0).round() as i32,
            lon_e2: (coordinates.lon * 100.0).round() as i32,
        }
    }

    /// The bucket's center point for lat/lon buckets.
    #[must_use]
    pub fn coordinates(&self) -> Option<Coordinates> {
        match *self {
            Self::LatLon { lat_e2, lon_e2 } => Some(Coordinates::new(
                f64::from(lon_e2) / 100.0,
                f64::from(lat_e2) / 100.0,
            )),
            Self::Cell { .. } => None,
        }
    }

    #[must_use]
    pub fn lat(&self) -> Option<f64> {
        self.coordinates().map(|c| c.lat)
    }

    #[must_use]
    pub fn lon(&self) -> Option<f64> {
        self.coordinates().map(|c| c.lon)
    }
}

impl fmt::Display for SpatialBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LatLon { lat_e2, lon_e2 } => write!(
                f,
                "({:.2}, {:.2})",
                f64::from(lat_e2) / 100.0,
                f64::from(lon_e2) / 100.0
            ),
            Self::Cell { cell } => write!(f, "{cell:x}"),
        }
    }
}

/// How events are quantized into spatial buckets for home/work inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum InferenceMethod {
    /// Round coordinates to two decimals (~110 m).
    LatLon,
    /// Use the H3 cell at a fixed resolution.
    GridCell {
        /// H3 resolution (0-15).
        resolution: u8,
    },
}

impl InferenceMethod {
    /// Stable tag used as the store key for this method's results
    /// (e.g. `latlon`, `cell9`).
    #[must_use]
    pub fn tag(&self) -> String {
        match self {
            Self::LatLon => "latlon".to_string(),
            Self::GridCell { resolution } => format!("cell{resolution}"),
        }
    }
}

impl fmt::Display for InferenceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// Error returned when an inference method tag cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidMethodError(pub String);

impl fmt::Display for InvalidMethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid inference method {:?} (expected `latlon` or `cell<resolution>`)",
            self.0
        )
    }
}

impl std::error::Error for InvalidMethodError {}

impl FromStr for InferenceMethod {
    type Err = InvalidMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "latlon" {
            return Ok(Self::LatLon);
        }
        s.strip_prefix("cell")
            .and_then(|r| r.parse::<u8>().ok())
            .filter(|r| *r <= 15)
            .map(|resolution| Self::GridCell { resolution })
            .ok_or(InvalidMethodError(s))
    }
}

impl From<InferenceMethod> for String {
    fn from(method: InferenceMethod) -> Self {
        method.tag()
    }
}

impl TryFrom<String> for InferenceMethod {
    type Error = InvalidMethodError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Per-bucket statistics for one actor's event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationStats {
    pub bucket: SpatialBucket,
    /// Total events in the bucket.
    pub freq: u64,
    /// Number of distinct hours of day with at least one event.
    pub unique_hours: u32,
    /// Latest hour minus earliest hour.
    pub hour_range: u32,
    /// Events at night (before 07:00 or after 22:59).
    pub night_freq: u64,
    /// Events on Saturday or Sunday.
    pub weekend_freq: u64,
    /// `freq` relative to the actor's busiest bucket.
    pub freq_ratio: f64,
}

impl LocationStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn night_share(&self) -> f64 {
        if self.freq == 0 {
            0.0
        } else {
            self.night_freq as f64 / self.freq as f64
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn weekend_share(&self) -> f64 {
        if self.freq == 0 {
            0.0
        } else {
            self.weekend_freq as f64 / self.freq as f64
        }
    }

    /// Home score: night share times weekend share.
    #[must_use]
    pub fn home_score(&self) -> f64 {
        self.night_share() * self.weekend_share()
    }

    /// Work score: daytime share times weekday share.
    #[must_use]
    pub fn work_score(&self) -> f64 {
        (1.0 - self.night_share()) * (1.0 - self.weekend_share())
    }
}

/// A fully inferred home and work location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomeWork {
    pub home: LocationStats,
    pub work: LocationStats,
    pub method: InferenceMethod,
}

/// Why inference stopped without a result.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    /// Fewer events than the inference threshold.
    #[strum(serialize = "insufficient data")]
    InsufficientData,
    /// A home was found but no other candidate bucket remained for work.
    #[strum(serialize = "no work location")]
    NoWorkLocation,
}

/// Outcome of home/work inference for one actor.
///
/// Either both locations are known or the result is `Incomplete`; there is
/// no partially populated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Classification {
    Complete(HomeWork),
    Incomplete { reason: IncompleteReason },
}

impl Classification {
    #[must_use]
    pub const fn incomplete(reason: IncompleteReason) -> Self {
        Self::Incomplete { reason }
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// The inferred home bucket, if inference completed.
    #[must_use]
    pub const fn home_bucket(&self) -> Option<&SpatialBucket> {
        match self {
            Self::Complete(hw) => Some(&hw.home.bucket),
            Self::Incomplete { .. } => None,
        }
    }

    /// The inferred work bucket, if inference completed.
    #[must_use]
    pub const fn work_bucket(&self) -> Option<&SpatialBucket> {
        match self {
            Self::Complete(hw) => Some(&hw.work.bucket),
            Self::Incomplete { .. } => None,
        }
    }
}

/// An actor and the classifications computed for it, keyed by
/// [`InferenceMethod::tag`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: ActorId,
    #[serde(default)]
    pub classifications: BTreeMap<String, Classification>,
}

impl Actor {
    #[must_use]
    pub const fn new(actor_id: ActorId) -> Self {
        Self {
            actor_id,
            classifications: BTreeMap::new(),
        }
    }

    /// The classification for `method`, if inference has been run.
    #[must_use]
    pub fn classification(&self, method: InferenceMethod) -> Option<&Classification> {
        self.classifications.get(&method.tag())
    }
}

/// An aggregation target and residency boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpatialUnit {
    /// An arbitrary polygon (e.g. a census radius) with a stable id.
    Area {
        id: String,
        /// `GeoJSON` `Polygon` or `MultiPolygon` geometry.
        boundary_geojson: String,
    },
    /// A cell of the H3 grid.
    Cell {
        /// Raw `u64` H3 index.
        cell: u64,
    },
}

impl SpatialUnit {
    /// Stable target id. Cells use their canonical lowercase hex form.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Area { id, .. } => id.clone(),
            Self::Cell { cell } => format!("{cell:x}"),
        }
    }
}

/// Calendar interval used to bucket event timestamps.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum BucketFrequency {
    #[strum(to_string = "daily", serialize = "d")]
    Daily,
    /// ISO weeks, starting Monday.
    #[strum(to_string = "weekly", serialize = "w")]
    Weekly,
    #[strum(to_string = "monthly", serialize = "m")]
    Monthly,
    #[default]
    #[strum(to_string = "quarterly", serialize = "q")]
    Quarterly,
    #[strum(to_string = "yearly", serialize = "y")]
    Yearly,
}

/// The four residency categories every unit result carries.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    TotalCounts,
    Residents,
    NonResidents,
    NonResidentsAndNonNeighbors,
}

/// Per-unit residency result: one sparse time series per category.
///
/// All four keys are always present, even when empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidencyCounts {
    pub totalcounts: BucketCounts,
    pub residents: BucketCounts,
    pub nonresidents: BucketCounts,
    pub nonresidentsandnonneighbors: BucketCounts,
}

impl ResidencyCounts {
    #[must_use]
    pub const fn get(&self, category: Category) -> &BucketCounts {
        match category {
            Category::TotalCounts => &self.totalcounts,
            Category::Residents => &self.residents,
            Category::NonResidents => &self.nonresidents,
            Category::NonResidentsAndNonNeighbors => &self.nonresidentsandnonneighbors,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.totalcounts.is_empty()
            && self.residents.is_empty()
            && self.nonresidents.is_empty()
            && self.nonresidentsandnonneighbors.is_empty()
    }
}

/// Number of actors whose inferred home lies inside a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidentTotal {
    pub totalusers: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inference_method_tags() {
        assert_eq!("latlon".parse::<InferenceMethod>().unwrap(), InferenceMethod::LatLon);
        assert_eq!(
            "cell9".parse::<InferenceMethod>().unwrap(),
            InferenceMethod::GridCell { resolution: 9 }
        );
        assert!("cell16".parse::<InferenceMethod>().is_err());
        assert!("hex".parse::<InferenceMethod>().is_err());
    }

    #[test]
    fn rounds_coordinates_to_hundredths() {
        let bucket = SpatialBucket::rounded(Coordinates::new(-58.4627, -34.6297));
        assert_eq!(
            bucket,
            SpatialBucket::LatLon {
                lat_e2: -3463,
                lon_e2: -5846
            }
        );
        let center = bucket.coordinates().unwrap();
        assert!((center.lat - -34.63).abs() < 1e-9);
        assert!((center.lon - -58.46).abs() < 1e-9);
        assert_eq!(bucket.lat(), Some(center.lat));
        assert_eq!(SpatialBucket::Cell { cell: 1 }.lon(), None);
    }

    #[test]
    fn parses_bucket_frequency_aliases() {
        assert_eq!("Q".parse::<BucketFrequency>().unwrap(), BucketFrequency::Quarterly);
        assert_eq!("monthly".parse::<BucketFrequency>().unwrap(), BucketFrequency::Monthly);
        assert_eq!(BucketFrequency::Weekly.to_string(), "weekly");
    }

    #[test]
    fn residency_counts_always_serialize_all_categories() {
        let json = serde_json::to_value(ResidencyCounts::default()).unwrap();
        let obj = json.as_object().unwrap();
        for key in [
            "totalcounts",
            "residents",
            "nonresidents",
            "nonresidentsandnonneighbors",
        ] {
            assert!(obj.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn category_names_match_result_keys() {
        assert_eq!(Category::TotalCounts.as_ref(), "totalcounts");
        assert_eq!(
            Category::NonResidentsAndNonNeighbors.to_string(),
            "nonresidentsandnonneighbors"
        );
    }

    #[test]
    fn classification_round_trips_through_json() {
        let incomplete = Classification::incomplete(IncompleteReason::NoWorkLocation);
        let json = serde_json::to_string(&incomplete).unwrap();
        assert!(json.contains("no_work_location"));
        let back: Classification = serde_json::from_str(&json).unwrap();
        assert_eq!(back, incomplete);
        assert_eq!(IncompleteReason::InsufficientData.to_string(), "insufficient data");
    }

    #[test]
    fn cell_unit_id_is_hex() {
        let unit = SpatialUnit::Cell {
            cell: 0x089d_d687_6033_ffff,
        };
        assert_eq!(unit.id(), "89dd6876033ffff");
    }
}
