//! In-memory R-tree over area units.
//!
//! Built once from the stored area units and used to attribute many points
//! (e.g. every inferred home) to the area containing them without a store
//! round-trip per point.

use std::collections::BTreeMap;

use geo::{Contains, MultiPolygon};
use mobility_models::{Coordinates, SpatialUnit};
use rstar::{AABB, RTree, RTreeObject};

use crate::{compute_envelope, parse_geojson_to_multipolygon};

/// An area polygon stored in the R-tree with its id.
struct AreaEntry {
    id: String,
    envelope: AABB<[f64; 2]>,
    polygon: MultiPolygon<f64>,
}

impl RTreeObject for AreaEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Point-in-polygon index over area units.
pub struct UnitIndex {
    areas: RTree<AreaEntry>,
}

impl UnitIndex {
    /// Builds the index from a set of units. Cell units and areas whose
    /// boundary does not parse are skipped with a warning.
    #[must_use]
    pub fn build(units: &[SpatialUnit]) -> Self {
        let mut entries = Vec::with_capacity(units.len());

        for unit in units {
            let SpatialUnit::Area {
                id,
                boundary_geojson,
            } = unit
            else {
                continue;
            };

            if id.is_empty() || boundary_geojson.is_empty() {
                continue;
            }

            let Some(polygon) = parse_geojson_to_multipolygon(boundary_geojson) else {
                log::warn!("Failed to parse GeoJSON for unit {id}");
                continue;
            };

            entries.push(AreaEntry {
                id: id.clone(),
                envelope: compute_envelope(&polygon),
                polygon,
            });
        }

        let areas = RTree::bulk_load(entries);
        log::info!("Loaded {} area units into spatial index", areas.size());

        Self { areas }
    }

    /// Number of indexed areas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.areas.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.areas.size() == 0
    }

    /// Look up the area id containing a point.
    ///
    /// Areas are expected to tile without overlap, so first match wins.
    #[must_use]
    pub fn lookup(&self, c: Coordinates) -> Option<&str> {
        let point = geo::Point::new(c.lon, c.lat);
        let query_env = AABB::from_point([c.lon, c.lat]);

        self.areas
            .locate_in_envelope_intersecting(&query_env)
            .find(|entry| entry.polygon.contains(&point))
            .map(|entry| entry.id.as_str())
    }

    /// Counts points per containing area. Points outside every area are
    /// dropped.
    #[must_use]
    pub fn count_points<I>(&self, points: I) -> BTreeMap<String, u64>
    where
        I: IntoIterator<Item = Coordinates>,
    {
        let mut counts = BTreeMap::new();
        for point in points {
            if let Some(id) = self.lookup(point) {
                *counts.entry(id.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }
}
