//! Resolved spatial units: parsed polygons and validated H3 cells.

use geo::{Contains, MultiPolygon, Point};
use h3o::{CellIndex, LatLng};
use mobility_models::{Coordinates, SpatialBucket, SpatialUnit};

use crate::{SpatialError, bucket_cell, bucket_point, cell_index, compute_envelope};

/// Axis-aligned lon/lat bounding box used as a coarse store pre-filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    #[must_use]
    pub fn contains(&self, c: Coordinates) -> bool {
        c.lon >= self.min_lon && c.lon <= self.max_lon && c.lat >= self.min_lat && c.lat <= self.max_lat
    }
}

/// A [`SpatialUnit`] with its geometry parsed and validated.
#[derive(Debug, Clone)]
pub enum TargetUnit {
    Area {
        id: String,
        polygon: MultiPolygon<f64>,
        bbox: BoundingBox,
    },
    Cell(CellIndex),
}

impl TargetUnit {
    /// Resolves a stored unit.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError`] if the boundary does not parse as a polygon
    /// or the cell index is invalid.
    pub fn from_unit(unit: &SpatialUnit) -> Result<Self, SpatialError> {
        match unit {
            SpatialUnit::Area {
                id,
                boundary_geojson,
            } => {
                let polygon = crate::parse_geojson_to_multipolygon(boundary_geojson)
                    .ok_or_else(|| SpatialError::InvalidGeometry { id: id.clone() })?;
                let env = compute_envelope(&polygon);
                Ok(Self::Area {
                    id: id.clone(),
                    bbox: BoundingBox {
                        min_lon: env.lower()[0],
                        min_lat: env.lower()[1],
                        max_lon: env.upper()[0],
                        max_lat: env.upper()[1],
                    },
                    polygon,
                })
            }
            SpatialUnit::Cell { cell } => Ok(Self::Cell(cell_index(*cell)?)),
        }
    }

    /// Stable id, matching [`SpatialUnit::id`].
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Area { id, .. } => id.clone(),
            Self::Cell(cell) => format!("{:x}", u64::from(*cell)),
        }
    }

    /// Bounding box of the unit.
    #[must_use]
    pub fn bbox(&self) -> BoundingBox {
        match self {
            Self::Area { bbox, .. } => *bbox,
            Self::Cell(cell) => {
                let mut bbox = BoundingBox {
                    min_lon: f64::INFINITY,
                    min_lat: f64::INFINITY,
                    max_lon: f64::NEG_INFINITY,
                    max_lat: f64::NEG_INFINITY,
                };
                for v in cell.boundary().iter() {
                    bbox.min_lon = bbox.min_lon.min(v.lng());
                    bbox.min_lat = bbox.min_lat.min(v.lat());
                    bbox.max_lon = bbox.max_lon.max(v.lng());
                    bbox.max_lat = bbox.max_lat.max(v.lat());
                }
                bbox
            }
        }
    }

    /// Whether a point lies within the unit.
    #[must_use]
    pub fn contains_point(&self, c: Coordinates) -> bool {
        match self {
            Self::Area { polygon, bbox, .. } => {
                bbox.contains(c) && polygon.contains(&Point::new(c.lon, c.lat))
            }
            Self::Cell(cell) => LatLng::new(c.lat, c.lon)
                .is_ok_and(|ll| ll.to_cell(cell.resolution()) == *cell),
        }
    }

    /// Whether a home/work bucket lies within the unit.
    ///
    /// Areas test the bucket's center point. Cells compare the bucket's
    /// cell at the unit's resolution.
    #[must_use]
    pub fn contains_bucket(&self, bucket: &SpatialBucket) -> bool {
        match self {
            Self::Area { .. } => bucket_point(bucket).is_some_and(|p| self.contains_point(p)),
            Self::Cell(cell) => bucket_cell(bucket, cell.resolution()) == Some(*cell),
        }
    }
}
