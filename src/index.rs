use rstar::{AABB, RStarInsertionStrategy, RTree, RTreeObject, RTreeParams};
use tracing::{debug, warn};

use crate::dataset::RegionFeature;
use crate::error::LayerError;
use crate::geometry::{BoundingRect, GeographicPoint, Polygon};

pub const QUERY_EPSILON: f64 = 1e-9;

pub struct RegionTreeParams;

impl RTreeParams for RegionTreeParams {
    const MIN_SIZE: usize = 25;
    const MAX_SIZE: usize = 50;
    const REINSERTION_COUNT: usize = 10;
    type DefaultInsertionStrategy = RStarInsertionStrategy;
}

#[derive(Debug, Clone)]
pub struct SpatialIndexEntry {
    pub id: String,
    pub polygon: Polygon,
    pub rect: BoundingRect,
}

impl SpatialIndexEntry {
    pub fn new(id: impl Into<String>, polygon: Polygon) -> Self {
        let rect = polygon.bounding_rect();
        Self {
            id: id.into(),
            polygon,
            rect,
        }
    }
}

impl RTreeObject for SpatialIndexEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.rect.min, self.rect.max)
    }
}

pub struct RegionIndex {
    tree: RTree<SpatialIndexEntry, RegionTreeParams>,
}

impl RegionIndex {
    pub fn build(entries: Vec<SpatialIndexEntry>) -> Self {
        debug!(entries = entries.len(), "bulk loading region index");
        Self {
            tree: RTree::bulk_load_with_params(entries),
        }
    }

    pub fn from_regions(regions: &[RegionFeature]) -> Self {
        let mut entries = Vec::with_capacity(regions.len());
        for region in regions {
            match Polygon::from_coords(&region.geometry.rings) {
                Ok(polygon) => entries.push(SpatialIndexEntry::new(region.id.clone(), polygon)),
                Err(err) => warn!(region = %region.id, "skipping region: {err}"),
            }
        }
        Self::build(entries)
    }

    pub fn try_from_regions(regions: &[RegionFeature]) -> Result<Self, LayerError> {
        let index = Self::from_regions(regions);
        if index.is_empty() && !regions.is_empty() {
            return Err(LayerError::DegenerateGeometry(
                "no region has usable geometry".to_string(),
            ));
        }
        Ok(index)
    }

    pub fn query_point(&self, point: &GeographicPoint) -> Vec<&SpatialIndexEntry> {
        let probe = BoundingRect::around(*point, QUERY_EPSILON);
        let envelope = AABB::from_corners(probe.min, probe.max);
        self.tree.locate_in_envelope_intersecting(&envelope).collect()
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}
