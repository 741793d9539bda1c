//! Wire types for the memory service protocol.
//!
//! Requests and responses are JSON-RPC 2.0 `tools/call` invocations,
//! identical over both transports; only the framing differs (newline-
//! delimited lines on a subprocess's stdio, or an HTTP POST body). The
//! service wraps its payload in `result.content[0].text` as a JSON string.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Tool names exposed by the memory service.
pub mod tools {
    /// Semantic retrieval by query text.
    pub const RETRIEVE: &str = "retrieve_memory";
    /// Retrieval by natural-language time expression.
    pub const RECALL: &str = "recall_memory";
    /// Store a record, returning its content hash.
    pub const STORE: &str = "store_memory";
    /// Retrieve records carrying any of the given tags.
    pub const SEARCH_BY_TAG: &str = "search_by_tag";
    /// Backend health and statistics.
    pub const HEALTH: &str = "check_database_health";
}

/// A stored memory record. Produced by the remote service; this crate
/// only deserializes and passes it through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Record text
    pub content: String,
    /// Deduplication hash assigned at store time
    pub content_hash: String,
    /// Tags (insertion order irrelevant)
    #[serde(default)]
    pub tags: Vec<String>,
    /// Record type ("note", "decision", "session-summary", ...)
    #[serde(default)]
    pub memory_type: Option<String>,
    /// Arbitrary metadata
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Similarity score assigned by the service for ranked results
    #[serde(default)]
    pub similarity_score: Option<f64>,
    /// Creation time
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    /// Create a record to be stored, computing its content hash the way
    /// the service does: sha256 over content plus sorted tags.
    pub fn new(content: impl Into<String>, tags: Vec<String>) -> Self {
        let content = content.into();
        let content_hash = content_hash(&content, &tags);
        Self {
            content,
            content_hash,
            tags,
            memory_type: None,
            metadata: HashMap::new(),
            similarity_score: None,
            created_at: Some(Utc::now()),
        }
    }

    /// Set the record type.
    pub fn with_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = Some(memory_type.into());
        self
    }

    /// Attach a metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Sha256 hex digest over content and sorted tags.
pub fn content_hash(content: &str, tags: &[String]) -> String {
    let mut sorted: Vec<&str> = tags.iter().map(|t| t.as_str()).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    for tag in sorted {
        hasher.update(b"\x00");
        hasher.update(tag.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Health check response, flattened from the service's nested shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// "healthy", "degraded", ...
    pub status: String,
    /// Backend identifier (e.g. "sqlite-vec")
    pub backend: String,
    /// Total stored records
    pub total_memories: u64,
    /// Raw statistics map for dashboards
    #[serde(default)]
    pub statistics: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// JSON-RPC envelope
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request identified by a numeric id.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: RpcParams,
}

/// `tools/call` parameters: an operation name and an argument map.
#[derive(Debug, Clone, Serialize)]
pub struct RpcParams {
    pub name: String,
    pub arguments: Value,
}

impl RpcRequest {
    /// Build a `tools/call` request.
    pub fn tool_call(id: u64, tool: &str, arguments: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: "tools/call".to_string(),
            params: RpcParams {
                name: tool.to_string(),
                arguments,
            },
        }
    }
}

/// A JSON-RPC response carrying either a result payload or an error.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<RpcResult>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// The service wraps its payload JSON in a text content block.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResult {
    #[serde(default)]
    pub content: Vec<RpcContent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcContent {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Structured error from the service.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    /// Unwrap the envelope into the payload JSON, translating structured
    /// errors and missing/undecodable payloads into the error taxonomy.
    pub fn into_payload(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(Error::Transport(format!(
                "service error {}: {}",
                err.code, err.message
            )));
        }

        let text = self
            .result
            .as_ref()
            .and_then(|r| r.content.first())
            .and_then(|c| c.text.as_deref())
            .ok_or_else(|| Error::MalformedResponse {
                detail: "response carried neither error nor text payload".to_string(),
            })?;

        serde_json::from_str(text).map_err(|e| Error::malformed_response(e.to_string(), text))
    }
}

/// Decode a payload `Value` into a typed shape.
pub fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T> {
    let raw = payload.to_string();
    serde_json::from_value(payload).map_err(|e| Error::malformed_response(e.to_string(), &raw))
}

/// Payload of `retrieve_memory`, `recall_memory`, and `search_by_tag`.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievePayload {
    #[serde(default)]
    pub memories: Vec<MemoryRecord>,
    #[serde(default)]
    pub total_results: usize,
}

/// Payload of `store_memory`.
#[derive(Debug, Clone, Deserialize)]
pub struct StorePayload {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of `check_database_health`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthPayload {
    pub status: String,
    pub backend: String,
    #[serde(default)]
    pub statistics: HashMap<String, Value>,
}

impl HealthPayload {
    /// Flatten into the public health shape.
    pub fn into_status(self) -> HealthStatus {
        let total_memories = self
            .statistics
            .get("total_memories")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        HealthStatus {
            status: self.status,
            backend: self.backend,
            total_memories,
            statistics: self.statistics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_hash_ignores_tag_order() {
        let a = content_hash("note", &["x".into(), "y".into()]);
        let b = content_hash("note", &["y".into(), "x".into()]);
        assert_eq!(a, b);

        let c = content_hash("other note", &["x".into(), "y".into()]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_request_serialization() {
        let req = RpcRequest::tool_call(7, tools::RETRIEVE, json!({"query": "auth", "n_results": 5}));
        let encoded = serde_json::to_value(&req).unwrap();

        assert_eq!(encoded["jsonrpc"], "2.0");
        assert_eq!(encoded["id"], 7);
        assert_eq!(encoded["method"], "tools/call");
        assert_eq!(encoded["params"]["name"], "retrieve_memory");
        assert_eq!(encoded["params"]["arguments"]["n_results"], 5);
    }

    #[test]
    fn test_response_payload_unwrap() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "result": {
                "content": [{"type": "text", "text": "{\"memories\": [], \"total_results\": 0}"}]
            }
        });
        let response: RpcResponse = serde_json::from_value(body).unwrap();
        let payload = response.into_payload().unwrap();
        let decoded: RetrievePayload = decode_payload(payload).unwrap();
        assert!(decoded.memories.is_empty());
    }

    #[test]
    fn test_structured_error_surfaces() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "error": {"code": -32601, "message": "Tool not found: bogus"}
        });
        let response: RpcResponse = serde_json::from_value(body).unwrap();
        let err = response.into_payload().unwrap_err();
        assert!(err.to_string().contains("-32601"));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "result": {"content": [{"type": "text", "text": "not json at all"}]}
        });
        let response: RpcResponse = serde_json::from_value(body).unwrap();
        let err = response.into_payload().unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { .. }));
    }

    #[test]
    fn test_record_roundtrip() {
        let record = MemoryRecord::new("we chose sqlite-vec", vec!["decision".into()])
            .with_type("decision")
            .with_metadata("project", "recall");
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: MemoryRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.content_hash, record.content_hash);
    }
}
