//! Rentmap Geo - Client-side geospatial acceleration for map-based listing browsers
//!
//! This library keeps a map UI responsive while it browses thousands of location-tagged
//! listings. It answers "which listings are inside this viewport" in sub-linear time, runs
//! that work off the caller's execution context, and avoids repeated calls to external
//! routing/isochrone services.
//!
//! # Architecture
//!
//! - **[`SpatialIndex`]**: Point quadtree over a fixed geographic bounding box
//! - **[`BoundedExpiringCache`]**: LRU + TTL key/value store for external service results
//! - **[`IndexWorker`]**: Isolated background thread speaking the request/response
//!   [`protocol`], reached through a cloneable [`IndexWorkerHandle`]
//! - **[`MapQueryFacade`]**: UI-facing service tying the worker and caches together
//!
//! # Performance Characteristics
//!
//! - **Build Time**: O(N log N) average, bounded by `max_depth` on dense clusters
//! - **Query Time**: O(log N + K) average where K=results
//! - **Cache**: O(1) get/set, O(N) expiry sweep

mod bounds;
mod cache;
pub mod config;
mod entity;
mod facade;
pub mod protocol;
mod quadtree;
pub mod utils;
mod worker;

// Public API exports
pub use bounds::{BoundingBox, GeoPoint};
pub use cache::{BoundedExpiringCache, CacheEntry};
pub use config::{CacheConfig, FacadeConfig, IndexConfig, WorkerConfig};
pub use entity::IndexedEntity;
pub use facade::{DatasetVersion, GeoService, MapQueryFacade};
pub use protocol::{CorrelationId, ErrorKind, WorkerRequest, WorkerResponse};
pub use quadtree::{IndexStats, SpatialIndex};
pub use worker::{IndexWorker, IndexWorkerHandle, WorkerState};

use std::time::Duration;

/// Error types for the geo module
#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),

    #[error("Invalid index configuration: {0}")]
    InvalidConfig(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Request {id} timed out after {after:?}")]
    Timeout { id: CorrelationId, after: Duration },

    #[error("Request id {0} is already in flight")]
    DuplicateId(CorrelationId),

    #[error("Index worker is not running")]
    WorkerUnavailable,

    #[error("Worker replied with {kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("Internal worker failure: {0}")]
    Internal(String),
}

impl GeoError {
    /// Wire-level kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidBounds(_) => ErrorKind::InvalidBounds,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Decode(_) => ErrorKind::DecodeError,
            Self::UnknownAction(_) => ErrorKind::UnknownAction,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::DuplicateId(_) => ErrorKind::DuplicateId,
            Self::WorkerUnavailable => ErrorKind::WorkerUnavailable,
            Self::Remote { kind, .. } => *kind,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for GeoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GeoError>;
