use serde::{Deserialize, Serialize};

use crate::error::LayerError;

pub const RECT_PAD: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeographicPoint {
    #[serde(rename = "longitude")]
    lon: f64,
    #[serde(rename = "latitude")]
    lat: f64,
}

impl GeographicPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn is_finite(&self) -> bool {
        self.lon.is_finite() && self.lat.is_finite()
    }

    fn from_coord(coord: &[f64]) -> Option<Self> {
        if coord.len() < 2 {
            return None;
        }
        let point = Self::new(coord[0], coord[1]);
        point.is_finite().then_some(point)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingRole {
    Outer,
    Hole,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ring {
    points: Vec<GeographicPoint>,
}

impl Ring {
    pub fn new(mut points: Vec<GeographicPoint>) -> Result<Self, LayerError> {
        if points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        if points.len() < 3 {
            return Err(LayerError::DegenerateGeometry(format!(
                "ring has {} usable points, need at least 3",
                points.len()
            )));
        }
        Ok(Self { points })
    }

    pub fn from_coords<C: AsRef<[f64]>>(coords: &[C]) -> Result<Self, LayerError> {
        let points = coords
            .iter()
            .filter_map(|coord| GeographicPoint::from_coord(coord.as_ref()))
            .collect();
        Self::new(points)
    }

    pub fn points(&self) -> &[GeographicPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Signed area, positive for clockwise traversal.
    pub fn signed_area(&self) -> f64 {
        let n = self.points.len();
        let mut sum = 0.0;
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            sum += (b.lon - a.lon) * (b.lat + a.lat);
        }
        sum / 2.0
    }

    pub fn role(&self) -> RingRole {
        if self.signed_area() > 0.0 {
            RingRole::Outer
        } else {
            RingRole::Hole
        }
    }

    pub fn reversed(&self) -> Self {
        let mut points = self.points.clone();
        points.reverse();
        Self { points }
    }

    pub fn contains(&self, point: &GeographicPoint) -> bool {
        let n = self.points.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let pi = self.points[i];
            let pj = self.points[j];
            if (pi.lat > point.lat) != (pj.lat > point.lat) {
                let cross_lon =
                    (pj.lon - pi.lon) * (point.lat - pi.lat) / (pj.lat - pi.lat) + pi.lon;
                if point.lon < cross_lon {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    pub fn bounding_rect(&self) -> BoundingRect {
        BoundingRect::covering(self.points.iter())
            .unwrap_or_else(|| BoundingRect::around(self.points[0], RECT_PAD))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    rings: Vec<Ring>,
    roles: Vec<RingRole>,
}

impl Polygon {
    pub fn new(rings: Vec<Ring>) -> Result<Self, LayerError> {
        if rings.is_empty() {
            return Err(LayerError::DegenerateGeometry(
                "polygon has no usable rings".to_string(),
            ));
        }
        let roles = classify_rings(&rings);
        Ok(Self { rings, roles })
    }

    pub fn from_coords(rings: &[Vec<Vec<f64>>]) -> Result<Self, LayerError> {
        let mut usable = Vec::with_capacity(rings.len());
        for (position, coords) in rings.iter().enumerate() {
            match Ring::from_coords(coords.as_slice()) {
                Ok(ring) => usable.push(ring),
                Err(err) => tracing::debug!(ring = position, "dropping ring: {err}"),
            }
        }
        Self::new(usable)
    }

    pub fn rings(&self) -> &[Ring] {
        &self.rings
    }

    pub fn roles(&self) -> &[RingRole] {
        &self.roles
    }

    pub fn outers(&self) -> impl Iterator<Item = &Ring> {
        self.rings_with(RingRole::Outer)
    }

    pub fn holes(&self) -> impl Iterator<Item = &Ring> {
        self.rings_with(RingRole::Hole)
    }

    fn rings_with(&self, role: RingRole) -> impl Iterator<Item = &Ring> {
        self.rings
            .iter()
            .zip(self.roles.iter())
            .filter(move |(_, r)| **r == role)
            .map(|(ring, _)| ring)
    }

    pub fn contains(&self, point: &GeographicPoint) -> bool {
        if !self.outers().any(|ring| ring.contains(point)) {
            return false;
        }
        !self.holes().any(|ring| ring.contains(point))
    }

    pub fn bounding_rect(&self) -> BoundingRect {
        BoundingRect::covering(self.rings.iter().flat_map(|ring| ring.points().iter()))
            .unwrap_or_else(|| self.rings[0].bounding_rect())
    }
}

// Roles come from winding. Only when no ring winds clockwise, which would
// leave the polygon empty, are roles taken from nesting depth instead.
fn classify_rings(rings: &[Ring]) -> Vec<RingRole> {
    let by_winding: Vec<RingRole> = rings.iter().map(Ring::role).collect();
    if by_winding.contains(&RingRole::Outer) {
        return by_winding;
    }

    rings
        .iter()
        .enumerate()
        .map(|(i, ring)| {
            let probe = ring.points()[0];
            let depth = rings
                .iter()
                .enumerate()
                .filter(|(j, other)| *j != i && other.contains(&probe))
                .count();
            if depth % 2 == 0 {
                RingRole::Outer
            } else {
                RingRole::Hole
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingRect {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

impl BoundingRect {
    pub fn covering<'a, I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a GeographicPoint>,
    {
        let mut min = [f64::INFINITY, f64::INFINITY];
        let mut max = [f64::NEG_INFINITY, f64::NEG_INFINITY];
        let mut found = false;
        for point in points {
            found = true;
            min[0] = min[0].min(point.lon);
            min[1] = min[1].min(point.lat);
            max[0] = max[0].max(point.lon);
            max[1] = max[1].max(point.lat);
        }
        if !found {
            return None;
        }
        if max[0] - min[0] <= 0.0 {
            max[0] = min[0] + RECT_PAD;
        }
        if max[1] - min[1] <= 0.0 {
            max[1] = min[1] + RECT_PAD;
        }
        Some(Self { min, max })
    }

    pub fn around(point: GeographicPoint, half: f64) -> Self {
        Self {
            min: [point.lon - half, point.lat - half],
            max: [point.lon + half, point.lat + half],
        }
    }

    pub fn width(&self) -> f64 {
        self.max[0] - self.min[0]
    }

    pub fn height(&self) -> f64 {
        self.max[1] - self.min[1]
    }

    pub fn contains_point(&self, point: &GeographicPoint) -> bool {
        point.lon >= self.min[0]
            && point.lon <= self.max[0]
            && point.lat >= self.min[1]
            && point.lat <= self.max[1]
    }

    pub fn intersects(&self, other: &BoundingRect) -> bool {
        self.min[0] <= other.max[0]
            && other.min[0] <= self.max[0]
            && self.min[1] <= other.max[1]
            && other.min[1] <= self.max[1]
    }
}
