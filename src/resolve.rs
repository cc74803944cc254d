use serde::Serialize;
use tracing::{debug, info};

use crate::dataset::PointCollection;
use crate::geometry::GeographicPoint;
use crate::index::RegionIndex;

/// Finds the region containing `point`. When regions overlap the first
/// candidate returned by the index wins.
pub fn resolve_point<'a>(point: &GeographicPoint, index: &'a RegionIndex) -> Option<&'a str> {
    if !point.is_finite() {
        return None;
    }
    index
        .query_point(point)
        .into_iter()
        .find(|entry| entry.polygon.contains(point))
        .map(|entry| entry.id.as_str())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionStats {
    pub resolved: usize,
    pub unresolved: usize,
}

pub fn resolve_points(points: &mut PointCollection, index: &RegionIndex) -> ResolutionStats {
    let mut stats = ResolutionStats::default();
    for point in &mut points.points {
        if point.region().is_some() {
            stats.resolved += 1;
            continue;
        }
        match resolve_point(&point.location, index) {
            Some(region) => {
                point.assign_region(region);
                stats.resolved += 1;
            }
            None => {
                debug!(point = %point.id, "point outside every region");
                stats.unresolved += 1;
            }
        }
    }
    info!(
        resolved = stats.resolved,
        unresolved = stats.unresolved,
        "resolved points"
    );
    stats
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::dataset::{PointFeature, RegionFeature, RegionGeometry};

    fn ring(coords: &[[f64; 2]]) -> Vec<Vec<f64>> {
        coords.iter().map(|c| c.to_vec()).collect()
    }

    fn donut() -> RegionIndex {
        // Both rings counter-clockwise: nesting decides which one is the hole.
        let outer = ring(&[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]);
        let hole = ring(&[[4.0, 4.0], [6.0, 4.0], [6.0, 6.0], [4.0, 6.0]]);
        RegionIndex::from_regions(&[RegionFeature {
            id: "A".to_string(),
            geometry: RegionGeometry {
                rings: vec![outer, hole],
            },
            attributes: BTreeMap::new(),
        }])
    }

    #[test]
    fn hole_excludes_points() {
        let index = donut();
        assert_eq!(resolve_point(&GeographicPoint::new(5.0, 5.0), &index), None);
        assert_eq!(resolve_point(&GeographicPoint::new(1.0, 1.0), &index), Some("A"));
        assert_eq!(resolve_point(&GeographicPoint::new(20.0, 20.0), &index), None);
    }

    #[test]
    fn non_finite_points_never_resolve() {
        let index = donut();
        assert_eq!(resolve_point(&GeographicPoint::new(f64::NAN, 1.0), &index), None);
    }

    #[test]
    fn first_match_wins_on_overlap() {
        let square = ring(&[[0.0, 0.0], [0.0, 10.0], [10.0, 10.0], [10.0, 0.0]]);
        let feature = |id: &str| RegionFeature {
            id: id.to_string(),
            geometry: RegionGeometry {
                rings: vec![square.clone()],
            },
            attributes: BTreeMap::new(),
        };
        let index = RegionIndex::from_regions(&[feature("first"), feature("second")]);
        let found = resolve_point(&GeographicPoint::new(5.0, 5.0), &index);
        assert!(matches!(found, Some("first") | Some("second")));
    }

    #[test]
    fn resolves_collection() {
        let index = donut();
        let mut points = PointCollection {
            points: vec![
                PointFeature::new("in", GeographicPoint::new(1.0, 1.0)),
                PointFeature::new("hole", GeographicPoint::new(5.0, 5.0)),
                PointFeature::new("out", GeographicPoint::new(20.0, 20.0)),
            ],
        };
        let stats = resolve_points(&mut points, &index);
        assert_eq!(
            stats,
            ResolutionStats {
                resolved: 1,
                unresolved: 2
            }
        );
        assert_eq!(points.points[0].region(), Some("A"));
        assert_eq!(points.points[1].region(), None);
    }
}
