//! Request/response contract between callers and the index worker
//!
//! The contract is transport-agnostic. In-process callers exchange the typed
//! [`WorkerRequest`]/[`WorkerResponse`] values over channels; other transports (stdio, a
//! browser worker bridge) exchange their JSON form:
//!
//! ```text
//! Request:  { "id": "...", "action": "buildIndex" | "query", "data": { ... } }
//! Response: { "id": "...", "success": bool, "action": "...", "results"?: [...],
//!             "entityCount"?: n, "error"?: { "kind": "...", "message": "..." } }
//! ```
//!
//! Every response echoes the request's correlation id so callers with overlapping
//! requests can discard stale replies.

use crate::config::IndexConfig;
use crate::{BoundingBox, GeoError, GeoPoint, IndexedEntity, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Caller-generated identifier echoed by the matching response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random id (UUID v4)
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Structured error categories carried in error replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidBounds,
    InvalidConfig,
    DecodeError,
    UnknownAction,
    Timeout,
    DuplicateId,
    WorkerUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidBounds => "invalidBounds",
            Self::InvalidConfig => "invalidConfig",
            Self::DecodeError => "decodeError",
            Self::UnknownAction => "unknownAction",
            Self::Timeout => "timeout",
            Self::DuplicateId => "duplicateId",
            Self::WorkerUnavailable => "workerUnavailable",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const ACTION_BUILD_INDEX: &str = "buildIndex";
pub const ACTION_QUERY: &str = "query";

fn default_max_items_per_node() -> usize {
    IndexConfig::default().max_items_per_node
}

fn default_max_depth() -> u32 {
    IndexConfig::default().max_depth
}

/// What to index: shared by `buildIndex` and `query`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub bounds: BoundingBox,
    /// Shared so in-process callers can resend the listing set without copying it
    pub entities: Arc<[IndexedEntity]>,
    #[serde(default = "default_max_items_per_node")]
    pub max_items_per_node: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Tag of the listing set; lets the worker keep the built tree resident
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_version: Option<String>,
}

impl IndexSpec {
    pub fn new(bounds: BoundingBox, entities: Arc<[IndexedEntity]>, config: IndexConfig) -> Self {
        Self {
            bounds,
            entities,
            max_items_per_node: config.max_items_per_node,
            max_depth: config.max_depth,
            dataset_version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.dataset_version = Some(version.into());
        self
    }

    pub fn config(&self) -> IndexConfig {
        IndexConfig::new(self.max_items_per_node, self.max_depth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryMode {
    #[default]
    Box,
    Radius,
}

/// Payload of a `query` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryData {
    #[serde(flatten)]
    pub index: IndexSpec,
    #[serde(default)]
    pub mode: QueryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_bounds: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_km: Option<f64>,
}

/// A resolved query window
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryTarget {
    Box(BoundingBox),
    Radius { center: GeoPoint, radius_km: f64 },
}

impl QueryData {
    pub fn in_box(index: IndexSpec, query_bounds: BoundingBox) -> Self {
        Self {
            index,
            mode: QueryMode::Box,
            query_bounds: Some(query_bounds),
            center: None,
            radius_km: None,
        }
    }

    pub fn in_radius(index: IndexSpec, center: GeoPoint, radius_km: f64) -> Self {
        Self {
            index,
            mode: QueryMode::Radius,
            query_bounds: None,
            center: Some(center),
            radius_km: Some(radius_km),
        }
    }

    /// Check that the fields required by `mode` are present
    pub fn target(&self) -> Result<QueryTarget> {
        match self.mode {
            QueryMode::Box => self
                .query_bounds
                .map(QueryTarget::Box)
                .ok_or_else(|| GeoError::Decode("box query requires queryBounds".to_string())),
            QueryMode::Radius => match (self.center, self.radius_km) {
                (Some(center), Some(radius_km)) => Ok(QueryTarget::Radius { center, radius_km }),
                _ => Err(GeoError::Decode(
                    "radius query requires center and radiusKm".to_string(),
                )),
            },
        }
    }
}

/// Action plus its payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum RequestBody {
    BuildIndex(IndexSpec),
    Query(QueryData),
}

impl RequestBody {
    pub fn action(&self) -> &'static str {
        match self {
            Self::BuildIndex(_) => ACTION_BUILD_INDEX,
            Self::Query(_) => ACTION_QUERY,
        }
    }
}

/// A request addressed to the index worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerRequest {
    pub id: CorrelationId,
    #[serde(flatten)]
    pub body: RequestBody,
}

impl WorkerRequest {
    pub fn new(id: CorrelationId, body: RequestBody) -> Self {
        Self { id, body }
    }

    /// `buildIndex` request with a generated id
    pub fn build_index(spec: IndexSpec) -> Self {
        Self::new(CorrelationId::generate(), RequestBody::BuildIndex(spec))
    }

    /// `query` request with a generated id
    pub fn query(data: QueryData) -> Self {
        Self::new(CorrelationId::generate(), RequestBody::Query(data))
    }

    pub fn action(&self) -> &'static str {
        self.body.action()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A request that could not be decoded, with whatever id could be recovered
#[derive(Debug)]
pub struct RejectedRequest {
    pub id: CorrelationId,
    pub action: String,
    pub error: GeoError,
}

impl RejectedRequest {
    pub fn into_response(self) -> WorkerResponse {
        WorkerResponse::failure(self.id, self.action, &self.error)
    }
}

/// Decode one JSON request
///
/// Unrecognized actions are reported as [`GeoError::UnknownAction`]; anything else that does
/// not match the contract is [`GeoError::Decode`]. The id is recovered whenever possible so
/// the error reply can still be matched by the caller.
pub fn decode_request(input: &str) -> std::result::Result<WorkerRequest, RejectedRequest> {
    let reject = |id: CorrelationId, action: &str, error: GeoError| RejectedRequest {
        id,
        action: action.to_string(),
        error,
    };

    let mut value: Value = serde_json::from_str(input)
        .map_err(|e| reject(CorrelationId::default(), "", e.into()))?;
    let Some(object) = value.as_object_mut() else {
        return Err(reject(
            CorrelationId::default(),
            "",
            GeoError::Decode("request must be a JSON object".to_string()),
        ));
    };

    let id = match object.get("id") {
        Some(Value::String(id)) => CorrelationId::from(id.as_str()),
        _ => {
            return Err(reject(
                CorrelationId::default(),
                "",
                GeoError::Decode("request id must be a string".to_string()),
            ));
        }
    };

    let action = match object.get("action") {
        Some(Value::String(action)) => action.clone(),
        _ => {
            return Err(reject(
                id,
                "",
                GeoError::Decode("request action must be a string".to_string()),
            ));
        }
    };

    let data = object.remove("data").unwrap_or(Value::Null);
    let body = match action.as_str() {
        ACTION_BUILD_INDEX => serde_json::from_value(data).map(RequestBody::BuildIndex),
        ACTION_QUERY => serde_json::from_value(data).map(RequestBody::Query),
        other => {
            let error = GeoError::UnknownAction(other.to_string());
            return Err(reject(id, other, error));
        }
    };

    match body {
        Ok(body) => Ok(WorkerRequest::new(id, body)),
        Err(e) => Err(reject(id, &action, e.into())),
    }
}

/// `{kind, message}` part of an error reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Reply to exactly one [`WorkerRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    #[serde(alias = "correlationId")]
    pub id: CorrelationId,
    pub success: bool,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<IndexedEntity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl WorkerResponse {
    pub fn built(id: CorrelationId, entity_count: usize) -> Self {
        Self {
            id,
            success: true,
            action: ACTION_BUILD_INDEX.to_string(),
            results: None,
            entity_count: Some(entity_count),
            error: None,
        }
    }

    pub fn results(id: CorrelationId, results: Vec<IndexedEntity>) -> Self {
        Self {
            id,
            success: true,
            action: ACTION_QUERY.to_string(),
            results: Some(results),
            entity_count: None,
            error: None,
        }
    }

    pub fn failure(id: CorrelationId, action: impl Into<String>, error: &GeoError) -> Self {
        Self {
            id,
            success: false,
            action: action.into(),
            results: None,
            entity_count: None,
            error: Some(ErrorBody {
                kind: error.kind(),
                message: error.to_string(),
            }),
        }
    }

    /// Turn an error reply into [`GeoError::Remote`]
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        let (kind, message) = match self.error {
            Some(ErrorBody { kind, message }) => (kind, message),
            None => (ErrorKind::Internal, "error reply without details".to_string()),
        };
        Err(GeoError::Remote { kind, message })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
