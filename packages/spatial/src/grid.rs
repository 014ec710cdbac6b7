//! H3 grid helpers.

use std::collections::BTreeSet;

use geo::{LineString, Polygon};
use h3o::{CellIndex, LatLng, Resolution};
use mobility_models::{Coordinates, SpatialBucket};

use crate::SpatialError;

/// Validates a numeric H3 resolution.
///
/// # Errors
///
/// Returns [`SpatialError::InvalidResolution`] if `res` is above 15.
pub fn resolution(res: u8) -> Result<Resolution, SpatialError> {
    Resolution::try_from(res).map_err(|_| SpatialError::InvalidResolution(res))
}

/// Parses a raw `u64` into a [`CellIndex`].
///
/// # Errors
///
/// Returns [`SpatialError::InvalidCell`] if `raw` is not a valid cell.
pub fn cell_index(raw: u64) -> Result<CellIndex, SpatialError> {
    CellIndex::try_from(raw).map_err(|_| SpatialError::InvalidCell(raw))
}

/// Returns the cell containing `coordinates` at `res`.
///
/// # Errors
///
/// Returns an error if the resolution or coordinates are invalid.
pub fn cell_at(coordinates: Coordinates, res: u8) -> Result<CellIndex, SpatialError> {
    let res = resolution(res)?;
    let ll = LatLng::new(coordinates.lat, coordinates.lon).map_err(|_| {
        SpatialError::InvalidCoordinates {
            lon: coordinates.lon,
            lat: coordinates.lat,
        }
    })?;
    Ok(ll.to_cell(res))
}

/// The cells at grid distance exactly `k` from `center`.
///
/// `k = 0` yields only the center. Closer cells are excluded: this is a
/// hollow ring, not a filled disk.
#[must_use]
pub fn ring(center: CellIndex, k: u32) -> BTreeSet<u64> {
    center
        .grid_disk_distances::<Vec<_>>(k)
        .into_iter()
        .filter(|(_, distance)| *distance == k)
        .map(|(cell, _)| u64::from(cell))
        .collect()
}

/// The center point of a bucket: the rounded coordinates for lat/lon
/// buckets, the cell centroid for cell buckets.
#[must_use]
pub fn bucket_point(bucket: &SpatialBucket) -> Option<Coordinates> {
    match bucket {
        SpatialBucket::LatLon { .. } => bucket.coordinates(),
        SpatialBucket::Cell { cell } => {
            let ll = LatLng::from(cell_index(*cell).ok()?);
            Some(Coordinates::new(ll.lng(), ll.lat()))
        }
    }
}

/// The cell at `res` that a bucket falls in.
///
/// Cell buckets at the same or a finer resolution map to their ancestor;
/// everything else goes through the bucket's center point.
#[must_use]
pub fn bucket_cell(bucket: &SpatialBucket, res: Resolution) -> Option<CellIndex> {
    if let SpatialBucket::Cell { cell } = bucket {
        let cell = cell_index(*cell).ok()?;
        if u8::from(cell.resolution()) >= u8::from(res) {
            return cell.parent(res);
        }
    }
    let point = bucket_point(bucket)?;
    let ll = LatLng::new(point.lat, point.lon).ok()?;
    Some(ll.to_cell(res))
}

/// The hexagon (or pentagon) outline of a cell as a closed polygon.
#[must_use]
pub fn cell_boundary_polygon(cell: CellIndex) -> Polygon<f64> {
    let mut coords: Vec<(f64, f64)> = cell.boundary().iter().map(|v| (v.lng(), v.lat())).collect();
    if let Some(first) = coords.first().copied() {
        coords.push(first);
    }
    Polygon::new(LineString::from(coords), vec![])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn center() -> CellIndex {
        cell_at(Coordinates::new(-58.4627, -34.6297), 9).unwrap()
    }

    #[test]
    fn ring_zero_is_center_only() {
        let c = center();
        let r = ring(c, 0);
        assert_eq!(r.len(), 1);
        assert!(r.contains(&u64::from(c)));
    }

    #[test]
    fn ring_one_is_six_neighbors_without_center() {
        let c = center();
        let r = ring(c, 1);
        assert_eq!(r.len(), 6);
        assert!(!r.contains(&u64::from(c)));
    }

    #[test]
    fn ring_two_excludes_closer_cells() {
        let c = center();
        let r1 = ring(c, 1);
        let r2 = ring(c, 2);
        assert_eq!(r2.len(), 12);
        assert!(r1.is_disjoint(&r2));
    }

    #[test]
    fn finer_cell_bucket_maps_to_parent() {
        let fine = cell_at(Coordinates::new(-58.4627, -34.6297), 10).unwrap();
        let bucket = SpatialBucket::Cell {
            cell: u64::from(fine),
        };
        let res9 = resolution(9).unwrap();
        assert_eq!(bucket_cell(&bucket, res9), Some(center()));
    }

    #[test]
    fn latlon_bucket_maps_through_center_point() {
        let bucket = SpatialBucket::rounded(Coordinates::new(-58.4627, -34.6297));
        let res9 = resolution(9).unwrap();
        let expected = cell_at(bucket.coordinates().unwrap(), 9).unwrap();
        assert_eq!(bucket_cell(&bucket, res9), Some(expected));
    }

    #[test]
    fn rejects_invalid_resolution_and_cell() {
        assert!(matches!(
            resolution(16),
            Err(SpatialError::InvalidResolution(16))
        ));
        assert!(cell_index(0).is_err());
    }

    #[test]
    fn boundary_polygon_is_closed() {
        let poly = cell_boundary_polygon(center());
        let ring = poly.exterior();
        assert_eq!(ring.0.first(), ring.0.last());
        assert_eq!(ring.0.len(), 7);
    }
}
