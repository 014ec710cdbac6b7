#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Minimal spatial predicates for residency analysis.
//!
//! Provides `GeoJSON` polygon parsing, point-in-polygon tests for area
//! units (with an R-tree index for attributing many points at once), and
//! H3 helpers: cell assignment, exact-distance ring expansion, and cell
//! containment for home buckets.

pub mod grid;
pub mod index;
pub mod unit;

pub use grid::{
    bucket_cell, bucket_point, cell_at, cell_boundary_polygon, cell_index, resolution, ring,
};
pub use index::UnitIndex;
pub use unit::{BoundingBox, TargetUnit};

use geo::MultiPolygon;
use geojson::GeoJson;
use rstar::AABB;

/// Errors raised when spatial inputs are malformed.
#[derive(Debug, thiserror::Error)]
pub enum SpatialError {
    /// An area's boundary was not a `GeoJSON` `Polygon`/`MultiPolygon`.
    #[error("Invalid boundary geometry for unit {id}")]
    InvalidGeometry {
        /// Id of the offending unit.
        id: String,
    },

    /// A raw `u64` was not a valid H3 cell index.
    #[error("Invalid H3 cell index: {0:#x}")]
    InvalidCell(u64),

    /// H3 resolutions run from 0 to 15.
    #[error("Invalid H3 resolution: {0}")]
    InvalidResolution(u8),

    /// Coordinates outside the valid lon/lat range (or NaN).
    #[error("Invalid coordinates: lon={lon}, lat={lat}")]
    InvalidCoordinates {
        /// Longitude in degrees.
        lon: f64,
        /// Latitude in degrees.
        lat: f64,
    },
}

/// Parse a `GeoJSON` string into a [`MultiPolygon`].
/// Handles both `Polygon` and `MultiPolygon` geometry types.
#[must_use]
pub fn parse_geojson_to_multipolygon(geojson_str: &str) -> Option<MultiPolygon<f64>> {
    let geojson: GeoJson = geojson_str.parse().ok()?;
    let geom = match geojson {
        GeoJson::Geometry(geom) => geom,
        GeoJson::Feature(feature) => feature.geometry?,
        GeoJson::FeatureCollection(_) => return None,
    };
    let geo_geom: geo::Geometry<f64> = geom.try_into().ok()?;
    match geo_geom {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        _ => None,
    }
}

/// Compute the bounding box envelope for a [`MultiPolygon`].
#[must_use]
pub fn compute_envelope(mp: &MultiPolygon<f64>) -> AABB<[f64; 2]> {
    use geo::BoundingRect;

    mp.bounding_rect().map_or_else(
        || AABB::from_point([0.0, 0.0]),
        |rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
    )
}
