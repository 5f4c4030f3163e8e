//! Point entities carried through the index

use crate::GeoPoint;
use serde::{Deserialize, Serialize};

/// A location-tagged record stored in the index
///
/// The payload is never inspected by the index; it is only carried through to query results.
/// On the wire the payload is an arbitrary JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedEntity<P = serde_json::Value> {
    /// Unique within one index build
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub payload: P,
}

impl<P> IndexedEntity<P> {
    pub fn new(id: impl Into<String>, lat: f64, lng: f64, payload: P) -> Self {
        Self {
            id: id.into(),
            lat,
            lng,
            payload,
        }
    }

    #[inline]
    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}
