//! Map-facing service tying the index worker and the result caches together
//!
//! All methods degrade instead of failing: an index failure means "show nothing new for this
//! viewport" and a geo-service failure means the enriched data (route line, isochrone overlay)
//! is simply absent.

use crate::cache::BoundedExpiringCache;
use crate::config::FacadeConfig;
use crate::protocol::{IndexSpec, QueryData};
use crate::utils::{positive_zero, round_coordinate};
use crate::worker::{IndexWorker, IndexWorkerHandle};
use crate::{BoundingBox, GeoPoint, IndexedEntity, Result};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// External routing/isochrone provider, called only on cache misses
///
/// Responses are opaque JSON and stored as-is. Retry policy belongs to the implementor.
pub trait GeoService: Send + Sync + 'static {
    type Error: fmt::Display + Send;

    fn route(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
    ) -> impl Future<Output = std::result::Result<Value, Self::Error>> + Send;

    fn isochrone(
        &self,
        profile: &str,
        center: GeoPoint,
    ) -> impl Future<Output = std::result::Result<Value, Self::Error>> + Send;
}

/// Tag identifying one loaded listing set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetVersion(String);

impl DatasetVersion {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
struct Dataset {
    version: DatasetVersion,
    bounds: BoundingBox,
    entities: Arc<[IndexedEntity]>,
}

pub struct MapQueryFacade<G> {
    service: G,
    config: FacadeConfig,
    worker: IndexWorker,
    route_cache: Mutex<BoundedExpiringCache<Value>>,
    isochrone_cache: Mutex<BoundedExpiringCache<Value>>,
    dataset: Mutex<Option<Dataset>>,
    viewport_seq: AtomicU64,
}

impl<G: GeoService> MapQueryFacade<G> {
    /// Create the facade and start its index worker (requires a tokio runtime)
    pub fn new(service: G, config: FacadeConfig) -> Result<Self> {
        config.index.validate()?;
        let worker = IndexWorker::spawn(config.worker.clone())?;

        let route_cache = BoundedExpiringCache::from_config(&config.route_cache);
        let isochrone_cache = BoundedExpiringCache::from_config(&config.isochrone_cache);

        Ok(Self {
            service,
            route_cache: Mutex::new(route_cache),
            isochrone_cache: Mutex::new(isochrone_cache),
            config,
            worker,
            dataset: Mutex::new(None),
            viewport_seq: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &FacadeConfig {
        &self.config
    }

    pub fn service(&self) -> &G {
        &self.service
    }

    fn worker(&self) -> &IndexWorkerHandle {
        self.worker.handle()
    }

    /// Version of the listing set queries currently run against
    pub fn current_version(&self) -> Option<DatasetVersion> {
        lock(&self.dataset).as_ref().map(|d| d.version.clone())
    }

    /// Replace the listing set and build its index in the worker
    ///
    /// Later viewport queries reuse the resident index instead of rebuilding it.
    pub async fn load_listings(
        &self,
        bounds: BoundingBox,
        entities: Vec<IndexedEntity>,
    ) -> Result<DatasetVersion> {
        bounds.validate()?;

        let dataset = Dataset {
            version: DatasetVersion::generate(),
            bounds,
            entities: entities.into(),
        };
        let count = self.worker().build_index(self.index_spec(&dataset)).await?;

        tracing::info!(
            version = %dataset.version,
            count,
            submitted = dataset.entities.len(),
            "Listings loaded"
        );
        let version = dataset.version.clone();
        *lock(&self.dataset) = Some(dataset);
        Ok(version)
    }

    /// Listings inside the viewport
    ///
    /// `None` means "show nothing new": no listings are loaded, the query failed, or a newer
    /// viewport request was issued while this one was in flight.
    pub async fn visible_listings(&self, viewport: BoundingBox) -> Option<Vec<IndexedEntity>> {
        let seq = self.viewport_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let dataset = self.current_dataset()?;

        let data = QueryData::in_box(self.index_spec(&dataset), viewport);
        let results = match self.worker().query(data).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(error = %e, "Viewport query failed");
                return None;
            }
        };

        if self.viewport_seq.load(Ordering::SeqCst) != seq {
            tracing::debug!(seq, "Discarding stale viewport results");
            return None;
        }
        Some(results)
    }

    /// Listings within `radius_km` of `center`
    pub async fn listings_near(
        &self,
        center: GeoPoint,
        radius_km: f64,
    ) -> Option<Vec<IndexedEntity>> {
        let dataset = self.current_dataset()?;
        let data = QueryData::in_radius(self.index_spec(&dataset), center, radius_km);
        self.worker()
            .query(data)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Radius query failed"))
            .ok()
    }

    /// Route between two points, served from cache when possible
    pub async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Option<Value> {
        let key = route_key(origin, destination);
        let cached = lock(&self.route_cache).get(&key).cloned();
        if cached.is_some() {
            tracing::trace!(key = %key, "Route cache hit");
            return cached;
        }

        match self.service.route(origin, destination).await {
            Ok(value) => {
                lock(&self.route_cache).set(key, value.clone());
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Route lookup failed");
                None
            }
        }
    }

    /// Isochrone around `center`, keyed on coordinates rounded to `isochrone_precision`
    pub async fn isochrone(&self, profile: &str, center: GeoPoint) -> Option<Value> {
        let key = isochrone_key(profile, center, self.config.isochrone_precision);
        let cached = lock(&self.isochrone_cache).get(&key).cloned();
        if cached.is_some() {
            tracing::trace!(key = %key, "Isochrone cache hit");
            return cached;
        }

        match self.service.isochrone(profile, center).await {
            Ok(value) => {
                lock(&self.isochrone_cache).set(key, value.clone());
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Isochrone lookup failed");
                None
            }
        }
    }

    /// Drop expired entries from both caches, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let routes = lock(&self.route_cache).sweep_expired();
        let isochrones = lock(&self.isochrone_cache).sweep_expired();
        routes + isochrones
    }

    pub fn clear_caches(&self) {
        lock(&self.route_cache).clear();
        lock(&self.isochrone_cache).clear();
    }

    /// Run [`Self::sweep_expired`] every `sweep_interval` until the facade is dropped
    pub fn spawn_cache_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        // tokio intervals panic on a zero period
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let facade: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(facade) = facade.upgrade() else {
                    break;
                };
                let removed = facade.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Periodic cache sweep");
                }
            }
            tracing::debug!("Cache sweeper stopped");
        })
    }

    fn current_dataset(&self) -> Option<Dataset> {
        let dataset = lock(&self.dataset).clone();
        if dataset.is_none() {
            tracing::debug!("No listings loaded");
        }
        dataset
    }

    fn index_spec(&self, dataset: &Dataset) -> IndexSpec {
        IndexSpec::new(dataset.bounds, dataset.entities.clone(), self.config.index)
            .with_version(dataset.version.as_str())
    }
}

impl<G> fmt::Debug for MapQueryFacade<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapQueryFacade")
            .field("config", &self.config)
            .field("route_cache", &self.route_cache)
            .field("isochrone_cache", &self.isochrone_cache)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Facade mutex poisoned; recovering");
        poisoned.into_inner()
    })
}

fn route_key(origin: GeoPoint, destination: GeoPoint) -> String {
    format!(
        "route:{},{}->{},{}",
        positive_zero(origin.lat),
        positive_zero(origin.lng),
        positive_zero(destination.lat),
        positive_zero(destination.lng)
    )
}

fn isochrone_key(profile: &str, center: GeoPoint, precision: u32) -> String {
    format!(
        "iso:{profile}:{}:{}",
        round_coordinate(center.lng, precision),
        round_coordinate(center.lat, precision)
    )
}
