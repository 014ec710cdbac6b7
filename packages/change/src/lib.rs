#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Before/after change rates over a committed residency panel.
//!
//! The panel is split at a cutoff date, each period is reduced per target
//! and category, and the relative change between the two periods is
//! reported. Changes computed from a small baseline are withheld: a
//! category whose before-level is at or below [`RELIABILITY_THRESHOLD`]
//! has no gated change.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, JsonValue, feature::Id};
use mobility_models::{Category, ResidencyCounts};
use mobility_spatial::{cell_boundary_polygon, cell_index};
use mobility_timeseries::{CategoryValues, PanelRow, flatten_counts};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumString};

/// Baseline levels at or below this produce no gated change.
pub const RELIABILITY_THRESHOLD: f64 = 50.0;

/// Errors raised when exporting change rows.
#[derive(Debug, thiserror::Error)]
pub enum ChangeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How the buckets of one period are reduced to a single level.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PeriodStatistic {
    /// Average of the buckets that have a value. No values means no level.
    #[default]
    Mean,
    /// Total of the buckets that have a value. No values sums to zero.
    Sum,
}

impl PeriodStatistic {
    #[allow(clippy::cast_precision_loss)]
    fn reduce(self, values: impl Iterator<Item = Option<u64>>) -> Option<f64> {
        let present: Vec<f64> = values.flatten().map(|v| v as f64).collect();
        match self {
            Self::Sum => Some(present.iter().sum()),
            Self::Mean => {
                (!present.is_empty()).then(|| present.iter().sum::<f64>() / present.len() as f64)
            }
        }
    }
}

/// One optional level per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryLevels {
    pub totalcounts: Option<f64>,
    pub residents: Option<f64>,
    pub nonresidents: Option<f64>,
    pub nonresidentsandnonneighbors: Option<f64>,
}

impl CategoryLevels {
    #[must_use]
    pub const fn get(&self, category: Category) -> Option<f64> {
        match category {
            Category::TotalCounts => self.totalcounts,
            Category::Residents => self.residents,
            Category::NonResidents => self.nonresidents,
            Category::NonResidentsAndNonNeighbors => self.nonresidentsandnonneighbors,
        }
    }

    fn from_fn(mut f: impl FnMut(Category) -> Option<f64>) -> Self {
        Self {
            totalcounts: f(Category::TotalCounts),
            residents: f(Category::Residents),
            nonresidents: f(Category::NonResidents),
            nonresidentsandnonneighbors: f(Category::NonResidentsAndNonNeighbors),
        }
    }
}

/// Change between the two periods for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub target_id: String,
    /// Baseline levels, kept so readers can judge the denominator.
    pub before: CategoryLevels,
    pub after: CategoryLevels,
    /// `(after - before) / before`, `None` when either level is missing or
    /// the baseline is zero.
    pub raw_change: CategoryLevels,
    /// `raw_change`, withheld where the baseline is at or below
    /// [`RELIABILITY_THRESHOLD`].
    pub change: CategoryLevels,
}

#[derive(Default)]
struct Periods {
    before: Vec<CategoryValues>,
    after: Vec<CategoryValues>,
}

fn levels(values: &[CategoryValues], statistic: PeriodStatistic) -> CategoryLevels {
    CategoryLevels::from_fn(|category| statistic.reduce(values.iter().map(|v| v.get(category))))
}

fn relative_change(before: Option<f64>, after: Option<f64>) -> Option<f64> {
    match (before, after) {
        (Some(b), Some(a)) if b != 0.0 => Some((a - b) / b),
        _ => None,
    }
}

/// Flattens committed per-target counts into one long panel.
#[must_use]
pub fn build_panel<'a, I>(results: I) -> Vec<PanelRow>
where
    I: IntoIterator<Item = (&'a str, &'a ResidencyCounts)>,
{
    results
        .into_iter()
        .flat_map(|(target_id, counts)| flatten_counts(target_id, counts))
        .collect()
}

/// Computes per-target change rates across `cutoff`.
///
/// A row belongs to the after period iff its bucket is strictly later than
/// `cutoff`. Targets without rows in both periods are omitted. Output is
/// ordered by target id.
#[must_use]
pub fn compute_changes(
    rows: &[PanelRow],
    cutoff: NaiveDate,
    statistic: PeriodStatistic,
) -> Vec<ChangeRow> {
    let mut by_target: BTreeMap<&str, Periods> = BTreeMap::new();
    for row in rows {
        let periods = by_target.entry(row.target_id.as_str()).or_default();
        if row.bucket > cutoff {
            periods.after.push(row.values);
        } else {
            periods.before.push(row.values);
        }
    }

    let targets = by_target.len();
    let changes: Vec<ChangeRow> = by_target
        .into_iter()
        .filter(|(_, p)| !p.before.is_empty() && !p.after.is_empty())
        .map(|(target_id, p)| {
            let before = levels(&p.before, statistic);
            let after = levels(&p.after, statistic);
            let raw_change = CategoryLevels::from_fn(|c| relative_change(before.get(c), after.get(c)));
            let change = CategoryLevels::from_fn(|c| {
                raw_change
                    .get(c)
                    .filter(|_| before.get(c).is_some_and(|b| b > RELIABILITY_THRESHOLD))
            });
            ChangeRow {
                target_id: target_id.to_string(),
                before,
                after,
                raw_change,
                change,
            }
        })
        .collect();

    log::debug!(
        "Computed changes for {} of {targets} targets ({} lack a period)",
        changes.len(),
        targets - changes.len()
    );

    changes
}

/// Cell outline for hex ids that are valid H3 cells.
fn cell_geometry(target_id: &str) -> Option<Geometry> {
    let raw = u64::from_str_radix(target_id, 16).ok()?;
    let cell = cell_index(raw).ok()?;
    Some(Geometry::new(geojson::Value::from(&cell_boundary_polygon(cell))))
}

/// Renders change rows as a `GeoJSON` feature collection.
///
/// Cell targets get their hexagon as geometry; other targets have no
/// geometry. Each category contributes `<category>_before`,
/// `<category>_after`, `<category>_raw_change` and `<category>_change`
/// properties, `null` where undefined.
#[must_use]
pub fn to_feature_collection(rows: &[ChangeRow]) -> FeatureCollection {
    let features = rows
        .iter()
        .map(|row| {
            let mut properties = JsonObject::new();
            properties.insert(
                "target_id".to_string(),
                JsonValue::from(row.target_id.clone()),
            );
            for category in Category::iter() {
                let name = category.as_ref();
                for (suffix, levels) in [
                    ("before", &row.before),
                    ("after", &row.after),
                    ("raw_change", &row.raw_change),
                    ("change", &row.change),
                ] {
                    properties.insert(
                        format!("{name}_{suffix}"),
                        JsonValue::from(levels.get(category)),
                    );
                }
            }

            Feature {
                bbox: None,
                geometry: cell_geometry(&row.target_id),
                id: Some(Id::String(row.target_id.clone())),
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

/// Writes change rows to `path` as `GeoJSON`.
///
/// # Errors
///
/// * [`ChangeError::Json`] if serialization fails
/// * [`ChangeError::Io`] if the file cannot be written
pub fn write_geojson(path: &Path, rows: &[ChangeRow]) -> Result<(), ChangeError> {
    let json = serde_json::to_string(&to_feature_collection(rows))?;
    std::fs::write(path, json)?;
    log::info!("Wrote {} change rows to {}", rows.len(), path.display());
    Ok(())
}
