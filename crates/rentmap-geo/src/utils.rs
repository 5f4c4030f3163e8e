//! Utility functions for coordinate rounding and approximate distances

use crate::GeoPoint;
use geo::{Distance, Haversine, Point};

/// Mean Earth radius in kilometers
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometers spanned by one degree of latitude on the mean sphere
pub const KM_PER_DEGREE_LAT: f64 = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;

/// Approximate great-circle distance in kilometers (spherical Earth)
#[inline]
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let a: Point<f64> = a.into();
    let b: Point<f64> = b.into();
    Haversine.distance(a, b) / 1000.0
}

/// Round a coordinate to a fixed number of decimal places
///
/// Negative zero is normalized so that `-0.00001` and `0.00001` produce the same value
/// (and therefore the same cache key) at low precision.
pub fn round_coordinate(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals.min(15) as i32);
    positive_zero((value * factor).round() / factor)
}

/// Map `-0.0` to `0.0`, leaving every other value untouched
#[inline]
pub fn positive_zero(value: f64) -> f64 {
    if value == 0.0 { 0.0 } else { value }
}
