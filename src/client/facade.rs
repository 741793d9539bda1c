//! High-level memory operations over a negotiated connection.
//!
//! The facade is the only surface the rest of the crate talks to. It
//! connects lazily on first use, bounds every operation with a timeout,
//! and degrades read paths gracefully: a malformed service response is
//! logged and reported as an empty result rather than an error.

use crate::client::negotiator::{ConnectMode, ConnectionInfo, ConnectionNegotiator};
use crate::client::transport::Transport;
use crate::client::types::{
    decode_payload, tools, HealthPayload, HealthStatus, MemoryRecord, RetrievePayload,
    StorePayload,
};
use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Default budget for a single memory operation.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;

/// Client for the memory service.
pub struct MemoryClient {
    negotiator: Arc<ConnectionNegotiator>,
    operation_timeout_ms: u64,
}

impl MemoryClient {
    /// Create a client over a negotiator. No connection is made until the
    /// first operation.
    pub fn new(negotiator: Arc<ConnectionNegotiator>) -> Self {
        Self {
            negotiator,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
        }
    }

    /// Override the per-operation budget.
    pub fn with_operation_timeout_ms(mut self, ms: u64) -> Self {
        self.operation_timeout_ms = ms;
        self
    }

    /// Explicitly establish a connection.
    pub async fn connect(&self, mode: ConnectMode) -> Result<()> {
        self.negotiator.connect(mode).await.map(|_| ())
    }

    /// Close the connection. Subsequent operations reconnect lazily.
    pub async fn disconnect(&self) {
        self.negotiator.disconnect().await;
    }

    /// Snapshot of connection state.
    pub async fn connection_info(&self) -> ConnectionInfo {
        self.negotiator.info().await
    }

    async fn ensure_connected(&self) -> Result<Arc<dyn Transport>> {
        if let Some(transport) = self.negotiator.transport().await {
            return Ok(transport);
        }
        self.negotiator.connect(ConnectMode::Auto).await
    }

    /// One timed request/response cycle. No retries here; callers decide
    /// whether a failure is worth a reconnect.
    async fn call(&self, tool: &'static str, arguments: Value) -> Result<Value> {
        let transport = self.ensure_connected().await?;
        let budget = Duration::from_millis(self.operation_timeout_ms);
        match tokio::time::timeout(budget, transport.call(tool, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(Error::operation_timeout(tool, self.operation_timeout_ms)),
        }
    }

    fn degrade(tool: &str, e: Error) -> Result<Vec<MemoryRecord>> {
        match e {
            Error::MalformedResponse { detail } => {
                tracing::warn!(tool, %detail, "unusable response, returning no results");
                Ok(Vec::new())
            }
            other => Err(other),
        }
    }

    /// Semantic search: the top `limit` memories relevant to `query`.
    pub async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let arguments = json!({ "query": query, "n_results": limit });
        let payload = match self.call(tools::RETRIEVE, arguments).await {
            Ok(p) => p,
            Err(e) => return Self::degrade(tools::RETRIEVE, e),
        };
        match decode_payload::<RetrievePayload>(payload) {
            Ok(results) => Ok(results.memories),
            Err(e) => Self::degrade(tools::RETRIEVE, e),
        }
    }

    /// Time-scoped recall, e.g. `"last week"` or `"yesterday"`.
    pub async fn retrieve_by_time(&self, expression: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let arguments = json!({ "query": expression, "n_results": limit });
        let payload = match self.call(tools::RECALL, arguments).await {
            Ok(p) => p,
            Err(e) => return Self::degrade(tools::RECALL, e),
        };
        match decode_payload::<RetrievePayload>(payload) {
            Ok(results) => Ok(results.memories),
            Err(e) => Self::degrade(tools::RECALL, e),
        }
    }

    /// Memories carrying any of the given tags.
    pub async fn search_by_tag(&self, tags: &[String], limit: usize) -> Result<Vec<MemoryRecord>> {
        let arguments = json!({ "tags": tags, "n_results": limit });
        let payload = match self.call(tools::SEARCH_BY_TAG, arguments).await {
            Ok(p) => p,
            Err(e) => return Self::degrade(tools::SEARCH_BY_TAG, e),
        };
        match decode_payload::<RetrievePayload>(payload) {
            Ok(results) => Ok(results.memories),
            Err(e) => Self::degrade(tools::SEARCH_BY_TAG, e),
        }
    }

    /// Store a memory. Returns the service-computed content hash, which is
    /// authoritative over any hash computed locally.
    pub async fn store(&self, record: &MemoryRecord) -> Result<String> {
        let arguments = json!({
            "content": record.content,
            "metadata": {
                "tags": record.tags,
                "type": record.memory_type,
            },
        });
        let payload = self.call(tools::STORE, arguments).await?;
        let stored: StorePayload = decode_payload(payload)?;
        if !stored.success {
            return Err(Error::Transport(format!(
                "store rejected: {}",
                stored.message.unwrap_or_else(|| "no reason given".to_string())
            )));
        }
        stored.content_hash.ok_or_else(|| {
            Error::malformed_response("store response missing content_hash", "")
        })
    }

    /// Service health and backing-store statistics.
    pub async fn health(&self) -> Result<HealthStatus> {
        let payload = self.call(tools::HEALTH, json!({})).await?;
        let health: HealthPayload = decode_payload(payload)?;
        Ok(health.into_status())
    }
}
