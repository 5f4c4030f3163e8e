//! Tunables for the index, caches, worker, and facade
//!
//! Every struct has a `Default` matching the recommended deployment values and
//! (de)serializes with durations expressed in seconds.

use crate::{GeoError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard ceiling for `max_depth`; past this the quadrants are narrower than a centimeter
pub const MAX_DEPTH_LIMIT: u32 = 32;

/// Quadtree split configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexConfig {
    /// A leaf splits once it holds more than this many entities (>= 1)
    pub max_items_per_node: usize,
    /// Depth ceiling; the root is depth 0. Values above [`MAX_DEPTH_LIMIT`] are capped
    pub max_depth: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_items_per_node: 8,
            max_depth: 8,
        }
    }
}

impl IndexConfig {
    pub fn new(max_items_per_node: usize, max_depth: u32) -> Self {
        Self {
            max_items_per_node,
            max_depth,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_items_per_node == 0 {
            return Err(GeoError::InvalidConfig(
                "max_items_per_node must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Same configuration with `max_depth` capped at [`MAX_DEPTH_LIMIT`]
    pub fn clamped(self) -> Self {
        Self {
            max_depth: self.max_depth.min(MAX_DEPTH_LIMIT),
            ..self
        }
    }
}

/// Size and freshness limits for one cache namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum live entries; 0 is treated as 1
    pub max_entries: usize,
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Background index worker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Caller-side deadline for a single request
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Number of requests that may be queued before `send` waits
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            queue_capacity: 64,
        }
    }
}

/// Everything the map-facing facade needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FacadeConfig {
    pub index: IndexConfig,
    pub route_cache: CacheConfig,
    pub isochrone_cache: CacheConfig,
    pub worker: WorkerConfig,
    /// Decimal places kept when keying isochrone lookups (4 ~ 11 m)
    pub isochrone_precision: u32,
    /// Period of the background expiry sweep
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            index: IndexConfig::default(),
            route_cache: CacheConfig::default(),
            isochrone_cache: CacheConfig::default(),
            worker: WorkerConfig::default(),
            isochrone_precision: 4,
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
