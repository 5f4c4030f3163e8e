//! Geographic primitives: points and axis-aligned lat/lng boxes

use crate::{GeoError, Result};
use geo::{Coord, Point, Rect};
use serde::{Deserialize, Serialize};

/// A WGS84 position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

impl From<GeoPoint> for Point<f64> {
    fn from(p: GeoPoint) -> Self {
        // geo uses x = longitude, y = latitude
        Point::new(p.lng, p.lat)
    }
}

impl From<Point<f64>> for GeoPoint {
    fn from(p: Point<f64>) -> Self {
        Self::new(p.y(), p.x())
    }
}

/// Axis-aligned rectangle in lat/lng degrees
///
/// Used both for the coverage area of an index and for query windows. A well-formed box
/// has finite coordinates with `min_lat <= max_lat` and `min_lng <= max_lng`; use
/// [`BoundingBox::validate`] at API entry points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        }
    }

    /// Build a box and validate it in one step
    pub fn try_new(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Result<Self> {
        let bbox = Self::new(min_lat, max_lat, min_lng, max_lng);
        bbox.validate()?;
        Ok(bbox)
    }

    /// Reject non-finite coordinates and inverted ranges
    pub fn validate(&self) -> Result<()> {
        let coords = [self.min_lat, self.max_lat, self.min_lng, self.max_lng];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(GeoError::InvalidBounds(format!(
                "non-finite coordinate in {self:?}"
            )));
        }
        if self.min_lat > self.max_lat {
            return Err(GeoError::InvalidBounds(format!(
                "min_lat {} > max_lat {}",
                self.min_lat, self.max_lat
            )));
        }
        if self.min_lng > self.max_lng {
            return Err(GeoError::InvalidBounds(format!(
                "min_lng {} > max_lng {}",
                self.min_lng, self.max_lng
            )));
        }
        Ok(())
    }

    /// Closed containment test (edges included)
    #[inline]
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lng >= self.min_lng && lng <= self.max_lng
    }

    #[inline]
    pub fn contains_point(&self, point: GeoPoint) -> bool {
        self.contains(point.lat, point.lng)
    }

    /// Standard axis-aligned overlap test; touching edges count as overlap
    #[inline]
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.max_lat < other.min_lat
            || self.min_lat > other.max_lat
            || self.max_lng < other.min_lng
            || self.min_lng > other.max_lng)
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    pub fn width_degrees(&self) -> f64 {
        self.max_lng - self.min_lng
    }

    pub fn height_degrees(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    /// Split at the midpoint latitude and longitude: NW, NE, SW, SE
    pub fn quarter(&self) -> [BoundingBox; 4] {
        let mid = self.center();
        [
            BoundingBox::new(mid.lat, self.max_lat, self.min_lng, mid.lng),
            BoundingBox::new(mid.lat, self.max_lat, mid.lng, self.max_lng),
            BoundingBox::new(self.min_lat, mid.lat, self.min_lng, mid.lng),
            BoundingBox::new(self.min_lat, mid.lat, mid.lng, self.max_lng),
        ]
    }

    /// Box enclosing every point within `radius_km` of `center`
    ///
    /// Uses a spherical approximation and widens the longitude span by 1/cos(lat), clamped
    /// to the valid lat/lng range. Near the poles the longitude span becomes the full circle.
    pub fn around(center: GeoPoint, radius_km: f64) -> Self {
        use crate::utils::KM_PER_DEGREE_LAT;

        let d_lat = radius_km / KM_PER_DEGREE_LAT;
        let cos_lat = center.lat.to_radians().cos();
        let d_lng = if cos_lat.abs() < 1e-9 {
            180.0
        } else {
            (d_lat / cos_lat).abs().min(180.0)
        };

        Self::new(
            (center.lat - d_lat).max(-90.0),
            (center.lat + d_lat).min(90.0),
            (center.lng - d_lng).max(-180.0),
            (center.lng + d_lng).min(180.0),
        )
    }
}

impl From<BoundingBox> for Rect<f64> {
    fn from(b: BoundingBox) -> Self {
        Rect::new(
            Coord {
                x: b.min_lng,
                y: b.min_lat,
            },
            Coord {
                x: b.max_lng,
                y: b.max_lat,
            },
        )
    }
}

impl From<Rect<f64>> for BoundingBox {
    fn from(r: Rect<f64>) -> Self {
        // Rect normalizes min/max on construction
        Self::new(r.min().y, r.max().y, r.min().x, r.max().x)
    }
}
