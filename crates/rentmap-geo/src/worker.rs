//! Background index worker
//!
//! Index builds and queries run on a dedicated OS thread so a large listing set never stalls
//! the caller's async executor. Callers talk to it through a cloneable [`IndexWorkerHandle`]:
//!
//! ```text
//! handle.send ──(bounded mpsc)──> "index-worker" thread ──(unbounded mpsc)──> dispatcher task
//!      ^                           WorkerState::handle                              │
//!      └──────────────── oneshot, looked up by correlation id ─────────────────────┘
//! ```
//!
//! The worker thread itself is single threaded and keeps at most one index resident,
//! tagged with the dataset version it was built from.

use crate::config::WorkerConfig;
use crate::protocol::{
    IndexSpec, QueryData, QueryTarget, RequestBody, WorkerRequest, WorkerResponse, decode_request,
};
use crate::{
    BoundingBox, CorrelationId, GeoError, IndexConfig, IndexedEntity, Result, SpatialIndex,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const ENCODE_FAILURE_REPLY: &str = r#"{"id":"","success":false,"action":"","error":{"kind":"internal","message":"failed to encode response"}}"#;

type PendingTable = Arc<DashMap<CorrelationId, PendingEntry>>;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

/// A caller waiting for the reply to one id; `token` tells apart reuses of the same id
#[derive(Debug)]
struct PendingEntry {
    token: u64,
    waiter: oneshot::Sender<WorkerResponse>,
}

/// Removes a caller's pending entry when its `send` finishes or is dropped
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: CorrelationId,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .remove_if(&self.id, |_, entry| entry.token == self.token);
    }
}

/// Index kept alive between requests
struct ResidentIndex {
    version: String,
    index: SpatialIndex,
}

impl ResidentIndex {
    fn matches(&self, version: &str, bounds: &BoundingBox, config: IndexConfig) -> bool {
        self.version == version
            && self.index.bounds() == *bounds
            && self.index.config() == config.clamped()
    }
}

/// Request handling state owned by the worker thread
///
/// Usable directly (synchronously) by transports that already run off the UI thread, such
/// as the CLI's stdio loop.
#[derive(Default)]
pub struct WorkerState {
    resident: Option<ResidentIndex>,
    #[cfg(test)]
    panic_next: bool,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dataset version of the resident index, if any
    pub fn resident_version(&self) -> Option<&str> {
        self.resident.as_ref().map(|r| r.version.as_str())
    }

    /// Handle one request, always producing exactly one response with the same id
    ///
    /// A panic while handling the request is turned into an `internal` error reply.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn handle(&mut self, request: WorkerRequest) -> WorkerResponse {
        let WorkerRequest { id, body } = request;
        let action = body.action();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            #[cfg(test)]
            if std::mem::take(&mut self.panic_next) {
                panic!("index corrupted");
            }
            match body {
                RequestBody::BuildIndex(spec) => self
                    .build_index(spec)
                    .map(|count| WorkerResponse::built(id.clone(), count)),
                RequestBody::Query(data) => self
                    .query(data)
                    .map(|results| WorkerResponse::results(id.clone(), results)),
            }
        }));

        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::debug!(%id, action, error = %e, "Request failed");
                WorkerResponse::failure(id, action, &e)
            }
            Err(payload) => {
                // The resident tree may be half-updated
                self.resident = None;
                let message = panic_message(payload.as_ref());
                tracing::error!(%id, action, reason = %message, "Index worker panicked");
                WorkerResponse::failure(id, action, &GeoError::Internal(message))
            }
        }
    }

    /// Handle one JSON-encoded request and return the JSON-encoded response
    pub fn handle_json(&mut self, input: &str) -> String {
        let response = match decode_request(input) {
            Ok(request) => self.handle(request),
            Err(rejected) => {
                tracing::debug!(id = %rejected.id, error = %rejected.error, "Rejected request");
                rejected.into_response()
            }
        };
        response.to_json().unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to encode worker response");
            ENCODE_FAILURE_REPLY.to_string()
        })
    }

    fn build_index(&mut self, spec: IndexSpec) -> Result<usize> {
        let config = spec.config();
        let index = SpatialIndex::build_from(spec.bounds, config, spec.entities.iter().cloned())?;
        let count = index.len();

        if let Some(version) = spec.dataset_version {
            tracing::debug!(version = %version, count, "Index resident");
            self.resident = Some(ResidentIndex { version, index });
        }
        Ok(count)
    }

    fn query(&mut self, data: QueryData) -> Result<Vec<IndexedEntity>> {
        let target = data.target()?;
        let spec = data.index;
        let config = spec.config();

        if let Some(version) = &spec.dataset_version
            && let Some(resident) = &self.resident
            && resident.matches(version, &spec.bounds, config)
        {
            return run_query(&resident.index, target);
        }

        let index = SpatialIndex::build_from(spec.bounds, config, spec.entities.iter().cloned())?;
        let results = run_query(&index, target)?;
        if let Some(version) = spec.dataset_version {
            tracing::debug!(version = %version, count = index.len(), "Index rebuilt for query");
            self.resident = Some(ResidentIndex { version, index });
        }
        Ok(results)
    }
}

fn run_query(index: &SpatialIndex, target: QueryTarget) -> Result<Vec<IndexedEntity>> {
    let found = match target {
        QueryTarget::Box(query_box) => index.query(&query_box)?,
        QueryTarget::Radius { center, radius_km } => index.query_radius(center, radius_km)?,
    };
    Ok(found.into_iter().cloned().collect())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// A running index worker: its thread, its dispatcher task, and a handle to reach it
pub struct IndexWorker {
    handle: IndexWorkerHandle,
    thread: std::thread::JoinHandle<()>,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl IndexWorker {
    /// Start the worker thread and the response dispatcher
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: WorkerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GeoError::Internal(format!("index worker needs a tokio runtime: {e}")))?;

        let (request_tx, request_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let pending: PendingTable = Arc::new(DashMap::new());

        let thread = std::thread::Builder::new()
            .name("index-worker".to_string())
            .spawn(move || worker_loop(request_rx, response_tx))
            .map_err(|e| GeoError::Internal(format!("failed to spawn index worker: {e}")))?;
        let dispatcher = runtime.spawn(dispatch_responses(response_rx, pending.clone()));

        tracing::info!(
            timeout_ms = config.request_timeout.as_millis() as u64,
            queue_capacity = config.queue_capacity,
            "Index worker started"
        );

        Ok(Self {
            handle: IndexWorkerHandle {
                requests: request_tx,
                pending,
                timeout: config.request_timeout,
            },
            thread,
            dispatcher,
        })
    }

    pub fn handle(&self) -> &IndexWorkerHandle {
        &self.handle
    }

    /// Stop accepting requests and wait for the worker to drain
    ///
    /// The worker only exits once every cloned handle has been dropped as well.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            handle,
            thread,
            dispatcher,
        } = self;
        drop(handle);

        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| GeoError::Internal(e.to_string()))?
            .map_err(|payload| GeoError::Internal(panic_message(payload.as_ref())))?;
        dispatcher
            .await
            .map_err(|e| GeoError::Internal(e.to_string()))?;

        tracing::info!("Index worker stopped");
        Ok(())
    }
}

fn worker_loop(
    mut requests: mpsc::Receiver<WorkerRequest>,
    responses: mpsc::UnboundedSender<WorkerResponse>,
) {
    #[cfg(feature = "profiling")]
    profiling::register_thread!("index-worker");

    let mut state = WorkerState::new();
    while let Some(request) = requests.blocking_recv() {
        let response = state.handle(request);
        if responses.send(response).is_err() {
            break;
        }
    }
    tracing::debug!("Index worker request channel closed");
}

async fn dispatch_responses(
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
    pending: PendingTable,
) {
    while let Some(response) = responses.recv().await {
        match pending.remove(&response.id) {
            Some((_, entry)) => {
                if entry.waiter.send(response).is_err() {
                    tracing::debug!("Caller stopped waiting before the response arrived");
                }
            }
            None => tracing::warn!(
                id = %response.id,
                action = %response.action,
                "Dropping response with no pending request"
            ),
        }
    }
}

/// Cloneable client side of the index worker
#[derive(Clone, Debug)]
pub struct IndexWorkerHandle {
    requests: mpsc::Sender<WorkerRequest>,
    pending: PendingTable,
    timeout: Duration,
}

impl IndexWorkerHandle {
    /// A handle to the same worker with a different request deadline
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Requests sent but not yet answered
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for the response carrying the same id
    ///
    /// Error replies are returned as-is (`success == false`); only transport failures and
    /// timeouts become `Err`. A response arriving after the deadline is discarded. An id
    /// that is already in flight on this worker is rejected with [`GeoError::DuplicateId`]
    /// before anything is queued.
    pub async fn send(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        let id = request.id.clone();
        let (waiter, reply) = oneshot::channel();
        let _registration = self.register(id.clone(), waiter)?;

        let exchange = async {
            self.requests
                .send(request)
                .await
                .map_err(|_| GeoError::WorkerUnavailable)?;
            reply.await.map_err(|_| GeoError::WorkerUnavailable)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    %id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Index request timed out"
                );
                Err(GeoError::Timeout {
                    id,
                    after: self.timeout,
                })
            }
        }
    }

    fn register(
        &self,
        id: CorrelationId,
        waiter: oneshot::Sender<WorkerResponse>,
    ) -> Result<PendingGuard<'_>> {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => Err(GeoError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry { token, waiter });
                Ok(PendingGuard {
                    pending: &self.pending,
                    id,
                    token,
                })
            }
        }
    }

    /// Build an index, returning how many entities it holds
    pub async fn build_index(&self, spec: IndexSpec) -> Result<usize> {
        let response = self.send(WorkerRequest::build_index(spec)).await?.into_result()?;
        response
            .entity_count
            .ok_or_else(|| GeoError::Internal("buildIndex reply without entityCount".to_string()))
    }

    /// Run a box or radius query
    pub async fn query(&self, data: QueryData) -> Result<Vec<IndexedEntity>> {
        let response = self.send(WorkerRequest::query(data)).await?.into_result()?;
        Ok(response.results.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::GeoPoint;
    use serde_json::{Value, json};

    fn area() -> BoundingBox {
        BoundingBox::new(0.0, 10.0, 0.0, 10.0)
    }

    fn entities() -> Arc<[IndexedEntity]> {
        (0..50)
            .map(|i| {
                let lat = (i % 10) as f64 + 0.5;
                let lng = (i / 5) as f64 + 0.25;
                IndexedEntity::new(format!("e{i}"), lat, lng, json!({ "n": i }))
            })
            .collect::<Vec<_>>()
            .into()
    }

    fn spec(entities: Arc<[IndexedEntity]>) -> IndexSpec {
        IndexSpec::new(area(), entities, IndexConfig::new(4, 6))
    }

    fn ids(results: &[IndexedEntity]) -> Vec<String> {
        let mut ids: Vec<_> = results.iter().map(|e| e.id.clone()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_build_index_reports_count() {
        let mut state = WorkerState::new();
        let request = WorkerRequest::new("b1".into(), RequestBody::BuildIndex(spec(entities())));
        let response = state.handle(request);

        assert!(response.success);
        assert_eq!(response.id.as_str(), "b1");
        assert_eq!(response.entity_count, Some(50));
        // No version: nothing stays resident
        assert_eq!(state.resident_version(), None);
    }

    #[test]
    fn test_query_matches_brute_force() {
        let mut state = WorkerState::new();
        let window = BoundingBox::new(2.0, 5.0, 1.0, 6.0);
        let request = WorkerRequest::new(
            "q1".into(),
            RequestBody::Query(QueryData::in_box(spec(entities()), window)),
        );
        let response = state.handle(request);
        assert!(response.success);

        let expected: Vec<_> = entities()
            .iter()
            .filter(|e| window.contains(e.lat, e.lng))
            .cloned()
            .collect();
        assert_eq!(ids(&response.results.unwrap()), ids(&expected));
    }

    #[test]
    fn test_resident_index_reused_by_version() {
        let mut state = WorkerState::new();
        let build = WorkerRequest::new(
            "b".into(),
            RequestBody::BuildIndex(spec(entities()).with_version("v1")),
        );
        assert!(state.handle(build).success);
        assert_eq!(state.resident_version(), Some("v1"));

        // Same version, no entities: answered from the resident tree
        let window = BoundingBox::new(0.0, 10.0, 0.0, 10.0);
        let query = QueryData::in_box(spec(Arc::from(Vec::new())).with_version("v1"), window);
        let response = state.handle(WorkerRequest::new("q".into(), RequestBody::Query(query)));
        assert_eq!(response.results.unwrap().len(), 50);

        // A different version rebuilds from the request's entities and replaces the slot
        let query = QueryData::in_box(spec(Arc::from(Vec::new())).with_version("v2"), window);
        let response = state.handle(WorkerRequest::new("q2".into(), RequestBody::Query(query)));
        assert_eq!(response.results.unwrap().len(), 0);
        assert_eq!(state.resident_version(), Some("v2"));
    }

    #[test]
    fn test_changed_config_rebuilds() {
        let mut state = WorkerState::new();
        let build = spec(entities()).with_version("v1");
        state.handle(WorkerRequest::new("b".into(), RequestBody::BuildIndex(build)));

        let mut changed = spec(Arc::from(Vec::new())).with_version("v1");
        changed.max_items_per_node = 2;
        let query = QueryData::in_box(changed, area());
        let response = state.handle(WorkerRequest::new("q".into(), RequestBody::Query(query)));
        assert!(response.results.unwrap().is_empty());
    }

    #[test]
    fn test_deep_config_reuses_resident_index() {
        let mut state = WorkerState::new();
        let deep = IndexSpec::new(area(), entities(), IndexConfig::new(4, 40)).with_version("v1");
        let response = state.handle(WorkerRequest::new("b".into(), RequestBody::BuildIndex(deep)));
        assert!(response.success);

        let empty = IndexSpec::new(area(), Arc::from(Vec::new()), IndexConfig::new(4, 40));
        let query = QueryData::in_box(empty.with_version("v1"), area());
        let response = state.handle(WorkerRequest::new("q".into(), RequestBody::Query(query)));
        assert_eq!(response.results.unwrap().len(), 50);
    }

    #[test]
    fn test_radius_query() {
        let mut state = WorkerState::new();
        let only = Arc::from(vec![
            IndexedEntity::new("near", 5.0, 5.0, Value::Null),
            IndexedEntity::new("far", 9.0, 9.0, Value::Null),
        ]);
        let data = QueryData::in_radius(spec(only), GeoPoint::new(5.01, 5.01), 5.0);
        let response = state.handle(WorkerRequest::new("r".into(), RequestBody::Query(data)));
        assert_eq!(ids(&response.results.unwrap()), vec!["near".to_string()]);
    }

    #[test]
    fn test_invalid_requests_become_error_replies() {
        let mut state = WorkerState::new();

        let inverted = IndexSpec::new(
            BoundingBox::new(10.0, 0.0, 0.0, 10.0),
            entities(),
            IndexConfig::default(),
        );
        let response = state.handle(WorkerRequest::new("x".into(), RequestBody::BuildIndex(inverted)));
        assert!(!response.success);
        assert_eq!(response.id.as_str(), "x");
        assert_eq!(response.error.unwrap().kind, ErrorKind::InvalidBounds);

        let bad_config = IndexSpec::new(area(), entities(), IndexConfig::new(0, 4));
        let request = WorkerRequest::new("y".into(), RequestBody::BuildIndex(bad_config));
        let response = state.handle(request);
        assert_eq!(response.error.unwrap().kind, ErrorKind::InvalidConfig);

        let inverted_window = BoundingBox::new(5.0, 1.0, 0.0, 1.0);
        let bad_window = QueryData::in_box(spec(entities()), inverted_window);
        let response = state.handle(WorkerRequest::new("z".into(), RequestBody::Query(bad_window)));
        assert_eq!(response.error.unwrap().kind, ErrorKind::InvalidBounds);
    }

    #[test]
    fn test_handle_json() {
        let mut state = WorkerState::new();

        let reply: Value = serde_json::from_str(&state.handle_json(
            r#"{"id":"j1","action":"frobnicate","data":{}}"#,
        ))
        .unwrap();
        assert_eq!(reply["id"], "j1");
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"]["kind"], "unknownAction");

        let request = json!({
            "id": "j2",
            "action": "buildIndex",
            "data": {
                "bounds": { "minLat": 0.0, "maxLat": 10.0, "minLng": 0.0, "maxLng": 10.0 },
                "entities": [ { "id": "a", "lat": 1.0, "lng": 1.0 } ],
                "maxItemsPerNode": 4,
                "maxDepth": 4
            }
        });
        let reply: Value = serde_json::from_str(&state.handle_json(&request.to_string())).unwrap();
        assert_eq!(
            reply,
            json!({ "id": "j2", "success": true, "action": "buildIndex", "entityCount": 1 })
        );

        let reply: Value = serde_json::from_str(&state.handle_json("not json")).unwrap();
        assert_eq!(reply["id"], "");
        assert_eq!(reply["error"]["kind"], "decodeError");
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }

    #[test]
    fn test_panic_becomes_internal_reply() {
        let mut state = WorkerState::new();
        let build = spec(entities()).with_version("v1");
        state.handle(WorkerRequest::new("b".into(), RequestBody::BuildIndex(build)));
        assert_eq!(state.resident_version(), Some("v1"));

        state.panic_next = true;
        let query = QueryData::in_box(spec(entities()).with_version("v1"), area());
        let response = state.handle(WorkerRequest::new("boom".into(), RequestBody::Query(query)));

        assert!(!response.success);
        assert_eq!(response.id.as_str(), "boom");
        assert_eq!(response.action, "query");
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Internal);
        assert!(error.message.contains("index corrupted"));
        assert_eq!(state.resident_version(), None);

        // The state keeps serving afterwards
        let request = WorkerRequest::new("b2".into(), RequestBody::BuildIndex(spec(entities())));
        assert!(state.handle(request).success);
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        assert!(matches!(
            IndexWorker::spawn(WorkerConfig::default()),
            Err(GeoError::Internal(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handle_round_trip() {
        let worker = IndexWorker::spawn(WorkerConfig::default()).unwrap();
        let handle = worker.handle().clone();

        let count = handle.build_index(spec(entities()).with_version("v1")).await.unwrap();
        assert_eq!(count, 50);

        let window = BoundingBox::new(0.0, 3.0, 0.0, 3.0);
        let results = handle
            .query(QueryData::in_box(spec(Arc::from(Vec::new())).with_version("v1"), window))
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().all(|e| window.contains(e.lat, e.lng)));
        assert_eq!(handle.pending_requests(), 0);

        drop(handle);
        worker.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_requests_are_matched_by_id() {
        let worker = IndexWorker::spawn(WorkerConfig::default()).unwrap();
        let handle = worker.handle().clone();
        handle.build_index(spec(entities()).with_version("v1")).await.unwrap();

        let mut tasks = Vec::new();
        for row in 0..10 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let lat = row as f64;
                let window = BoundingBox::new(lat, lat + 0.9, 0.0, 10.0);
                let resident = spec(Arc::from(Vec::new())).with_version("v1");
                let query = QueryData::in_box(resident, window);
                (window, handle.query(query).await.unwrap())
            }));
        }
        for task in tasks {
            let (window, results) = task.await.unwrap();
            assert_eq!(results.len(), 5);
            assert!(results.iter().all(|e| window.contains(e.lat, e.lng)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_reply_is_remote_error() {
        let worker = IndexWorker::spawn(WorkerConfig::default()).unwrap();
        let handle = worker.handle().clone();
        let bad = IndexSpec::new(area(), entities(), IndexConfig::new(0, 4));
        match handle.build_index(bad).await {
            Err(GeoError::Remote { kind, .. }) => assert_eq!(kind, ErrorKind::InvalidConfig),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_discards_late_response() {
        let timeout = Duration::from_millis(20);
        let (handle, mut inbox, responses) = detached_handle(4, timeout);

        let request = WorkerRequest::build_index(spec(entities()));
        let id = request.id.clone();
        match handle.send(request).await {
            Err(GeoError::Timeout { id: timed_out, after }) => {
                assert_eq!(timed_out, id);
                assert_eq!(after, timeout);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(handle.pending_requests(), 0);

        // The late reply finds no waiter and is dropped
        let late = inbox.recv().await.unwrap();
        responses.send(WorkerResponse::built(late.id, 50)).unwrap();

        // The next exchange still gets its own reply
        let caller = handle.clone();
        let next = tokio::spawn(async move {
            caller.send(WorkerRequest::build_index(spec(entities()))).await
        });
        let request = inbox.recv().await.unwrap();
        responses.send(WorkerResponse::built(request.id, 7)).unwrap();
        let response = next.await.unwrap().unwrap();
        assert_eq!(response.entity_count, Some(7));
        assert_eq!(handle.pending_requests(), 0);
    }

    /// A handle whose requests land in a channel the test answers by hand
    fn detached_handle(
        capacity: usize,
        timeout: Duration,
    ) -> (
        IndexWorkerHandle,
        mpsc::Receiver<WorkerRequest>,
        mpsc::UnboundedSender<WorkerResponse>,
    ) {
        let (requests, inbox) = mpsc::channel(capacity);
        let (responses, outbox) = mpsc::unbounded_channel();
        let pending: PendingTable = Arc::new(DashMap::new());
        tokio::spawn(dispatch_responses(outbox, pending.clone()));
        let handle = IndexWorkerHandle {
            requests,
            pending,
            timeout,
        };
        (handle, inbox, responses)
    }

    #[tokio::test]
    async fn test_duplicate_id_in_flight_is_rejected() {
        let (handle, mut inbox, responses) = detached_handle(4, Duration::from_secs(5));
        let build = || RequestBody::BuildIndex(spec(entities()));

        let caller = handle.clone();
        let first =
            tokio::spawn(async move { caller.send(WorkerRequest::new("dup".into(), build())).await });
        let queued = inbox.recv().await.unwrap();
        assert_eq!(queued.id.as_str(), "dup");

        match handle.send(WorkerRequest::new("dup".into(), build())).await {
            Err(GeoError::DuplicateId(id)) => assert_eq!(id.as_str(), "dup"),
            other => panic!("unexpected {other:?}"),
        }
        // The rejected call neither queued a request nor disturbed the first waiter
        assert!(inbox.try_recv().is_err());
        assert_eq!(handle.pending_requests(), 1);

        responses.send(WorkerResponse::built(queued.id, 3)).unwrap();
        let response = first.await.unwrap().unwrap();
        assert_eq!(response.entity_count, Some(3));
        assert_eq!(handle.pending_requests(), 0);

        // Once answered, the id can be used again
        let caller = handle.clone();
        let again =
            tokio::spawn(async move { caller.send(WorkerRequest::new("dup".into(), build())).await });
        let queued = inbox.recv().await.unwrap();
        responses.send(WorkerResponse::built(queued.id, 4)).unwrap();
        assert_eq!(again.await.unwrap().unwrap().entity_count, Some(4));
    }

    #[tokio::test]
    async fn test_abandoned_sends_leave_no_pending_entries() {
        let (handle, mut inbox, _responses) = detached_handle(1, Duration::from_secs(60));
        // Fill the queue so every further send waits for capacity
        handle
            .requests
            .try_send(WorkerRequest::build_index(spec(entities())))
            .unwrap();

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let caller = handle.clone();
                tokio::spawn(async move {
                    caller.send(WorkerRequest::build_index(spec(entities()))).await
                })
            })
            .collect();
        while handle.pending_requests() < 5 {
            tokio::task::yield_now().await;
        }

        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            assert!(task.await.unwrap_err().is_cancelled());
        }
        assert_eq!(handle.pending_requests(), 0);

        // Only the request that filled the queue was ever enqueued
        assert!(inbox.recv().await.is_some());
        assert!(inbox.try_recv().is_err());
    }
}
