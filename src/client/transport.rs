//! Pluggable transports for the memory service.
//!
//! Every transport implements the same capability set (connect, operate,
//! healthcheck) and is selected by configuration, never by fallback logic
//! baked into call sites:
//!
//! - **stdio**: spawn the service as a subprocess and exchange newline-
//!   delimited JSON-RPC over its standard streams; readiness is a marker
//!   line on its stderr.
//! - **http**: POST the same JSON-RPC body to `/mcp`, authenticated with a
//!   pre-shared bearer key; health lives at the unauthenticated
//!   `/api/health`.
//! - **in-memory**: a loopback store for tests; same contract, no wire.

use crate::client::types::{
    content_hash, tools, MemoryRecord, RpcRequest, RpcResponse,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Wire protocol of an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// JSON-RPC over a subprocess's standard streams
    Mcp,
    /// JSON-RPC over HTTP
    Http,
    /// Loopback test transport
    InMemory,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mcp => write!(f, "mcp"),
            Self::Http => write!(f, "http"),
            Self::InMemory => write!(f, "in_memory"),
        }
    }
}

/// A live channel to the memory service.
///
/// `call` performs one request/response cycle and returns the decoded
/// payload JSON. Transports own request/response correlation; callers own
/// operation timeouts.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The protocol this transport speaks.
    fn protocol(&self) -> Protocol;

    /// Invoke a tool and return its payload.
    async fn call(&self, tool: &str, arguments: Value) -> Result<Value>;

    /// Cheap liveness probe used during handshakes and status checks.
    async fn healthcheck(&self) -> Result<()>;

    /// Tear the channel down. Idempotent.
    async fn close(&self);
}

/// A connection candidate, selected and ordered by configuration.
#[derive(Clone)]
pub enum TransportEndpoint {
    /// Spawn the service as a subprocess
    Stdio(StdioEndpoint),
    /// Reach a running service over HTTP
    Http(HttpEndpoint),
    /// Loopback service for tests
    InMemory(Arc<InMemoryService>),
}

impl TransportEndpoint {
    /// Protocol this endpoint would establish.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Stdio(_) => Protocol::Mcp,
            Self::Http(_) => Protocol::Http,
            Self::InMemory(_) => Protocol::InMemory,
        }
    }

    /// Human-readable descriptor: the command line, the base URL, or the
    /// loopback marker.
    pub fn describe(&self) -> String {
        match self {
            Self::Stdio(e) if e.args.is_empty() => e.command.clone(),
            Self::Stdio(e) => format!("{} {}", e.command, e.args.join(" ")),
            Self::Http(e) => e.base_url.clone(),
            Self::InMemory(_) => "in-memory".to_string(),
        }
    }

    /// Attempt to connect and handshake within `connect_timeout_ms`.
    /// A failed candidate is fully torn down before the error returns.
    pub async fn connect(&self, connect_timeout_ms: u64) -> Result<Box<dyn Transport>> {
        let budget = Duration::from_millis(connect_timeout_ms);
        let protocol = self.protocol();

        let attempt = async {
            match self {
                Self::Stdio(endpoint) => {
                    let transport = StdioTransport::spawn(endpoint.clone()).await?;
                    Ok(Box::new(transport) as Box<dyn Transport>)
                }
                Self::Http(endpoint) => {
                    let transport = HttpTransport::new(endpoint.clone(), connect_timeout_ms)?;
                    transport.healthcheck().await?;
                    Ok(Box::new(transport) as Box<dyn Transport>)
                }
                Self::InMemory(service) => {
                    let transport = service.clone().connect().await?;
                    Ok(Box::new(transport) as Box<dyn Transport>)
                }
            }
        };

        match tokio::time::timeout(budget, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::connection_timeout(protocol.to_string(), connect_timeout_ms)),
        }
    }
}

// ---------------------------------------------------------------------------
// stdio transport
// ---------------------------------------------------------------------------

/// Startup banner the service prints when it is ready to serve.
pub const DEFAULT_READY_MARKER: &str = "MCP Memory Service";

/// Descriptor for spawning the memory service as a subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioEndpoint {
    /// Command to run; `~` is expanded, bare names resolved via PATH
    pub command: String,
    /// Command arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Line on the child's stderr that signals readiness
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,
}

fn default_ready_marker() -> String {
    DEFAULT_READY_MARKER.to_string()
}

impl StdioEndpoint {
    /// Create a descriptor with the default ready marker.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ready_marker: default_ready_marker(),
        }
    }
}

struct StdioIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Subprocess transport: newline-delimited JSON-RPC over stdin/stdout.
pub struct StdioTransport {
    child: Mutex<Child>,
    /// One request/response cycle at a time; responses for a cancelled
    /// in-flight request are skipped by id on the next cycle.
    io: Mutex<StdioIo>,
    next_id: AtomicU64,
}

impl StdioTransport {
    /// Spawn the service and wait for its ready marker.
    ///
    /// The caller bounds the whole attempt with the connect timeout; on
    /// failure the child is killed via `kill_on_drop`.
    pub async fn spawn(endpoint: StdioEndpoint) -> Result<Self> {
        let mut command = resolve_command(&endpoint)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to spawn memory service: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("no stdin handle on memory service".to_string()))?;
        let stdout = BufReader::new(
            child
                .stdout
                .take()
                .ok_or_else(|| Error::Transport("no stdout handle on memory service".to_string()))?,
        )
        .lines();
        let mut stderr = BufReader::new(
            child
                .stderr
                .take()
                .ok_or_else(|| Error::Transport("no stderr handle on memory service".to_string()))?,
        )
        .lines();

        // Handshake: wait for the ready marker in the diagnostic stream.
        loop {
            match stderr.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(target: "recall_core::service", "{}", line);
                    if line.contains(&endpoint.ready_marker) {
                        break;
                    }
                }
                Ok(None) => {
                    return Err(Error::Transport(
                        "memory service exited before signaling readiness".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(Error::Transport(format!(
                        "failed to read memory service stderr: {}",
                        e
                    )));
                }
            }
        }

        // Keep draining stderr so the child never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = stderr.next_line().await {
                tracing::debug!(target: "recall_core::service", "{}", line);
            }
        });

        Ok(Self {
            child: Mutex::new(child),
            io: Mutex::new(StdioIo { stdin, stdout }),
            next_id: AtomicU64::new(0),
        })
    }
}

/// Expand and resolve the configured command.
fn resolve_command(endpoint: &StdioEndpoint) -> Result<Command> {
    let expanded = shellexpand::tilde(&endpoint.command).into_owned();

    let program: PathBuf = if expanded.contains(std::path::MAIN_SEPARATOR) {
        PathBuf::from(expanded)
    } else {
        which::which(&expanded)
            .map_err(|e| Error::Transport(format!("command '{}' not found: {}", expanded, e)))?
    };

    let mut command = Command::new(program);
    command.args(&endpoint.args);
    Ok(command)
}

#[async_trait]
impl Transport for StdioTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Mcp
    }

    async fn call(&self, tool: &str, arguments: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = RpcRequest::tool_call(id, tool, arguments);
        let line = serde_json::to_string(&request)?;

        let mut io = self.io.lock().await;

        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("failed to write request: {}", e)))?;
        io.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Transport(format!("failed to write request: {}", e)))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("failed to flush request: {}", e)))?;

        loop {
            let line = io
                .stdout
                .next_line()
                .await
                .map_err(|e| Error::Transport(format!("failed to read response: {}", e)))?
                .ok_or_else(|| {
                    Error::Transport("memory service closed its stdout".to_string())
                })?;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let response: RpcResponse = serde_json::from_str(line)
                .map_err(|e| Error::malformed_response(e.to_string(), line))?;

            // Correlation by id: skip responses for abandoned requests.
            if response.id != Some(id) {
                tracing::debug!(expected = id, got = ?response.id, "skipping stale response");
                continue;
            }

            return response.into_payload();
        }
    }

    async fn healthcheck(&self) -> Result<()> {
        self.call(tools::HEALTH, json!({})).await.map(|_| ())
    }

    async fn close(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            tracing::debug!("memory service already gone: {}", e);
        }
        let _ = child.wait().await;
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// Descriptor for reaching a running memory service over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEndpoint {
    /// Base URL, e.g. `http://127.0.0.1:8000`
    pub base_url: String,
    /// Pre-shared key sent as `Authorization: Bearer <key>` on `/mcp`
    #[serde(default)]
    pub api_key: Option<String>,
}

impl HttpEndpoint {
    /// Create a descriptor without authentication.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    /// Set the pre-shared authentication key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// HTTP transport: JSON-RPC POSTs to `/mcp`.
pub struct HttpTransport {
    endpoint: HttpEndpoint,
    http: reqwest::Client,
    /// Budget for healthcheck probes; operation timeouts are the caller's.
    probe_timeout: Duration,
    next_id: AtomicU64,
}

impl HttpTransport {
    /// Build the client. Does not touch the network; the handshake is the
    /// first `healthcheck` call.
    pub fn new(endpoint: HttpEndpoint, probe_timeout_ms: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint,
            http,
            probe_timeout: Duration::from_millis(probe_timeout_ms),
            next_id: AtomicU64::new(0),
        })
    }

    fn classify(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::connection_timeout("http", self.probe_timeout.as_millis() as u64)
        } else if e.is_connect() {
            Error::connection_refused("http", e.to_string())
        } else {
            Error::Transport(format!("http: {}", e))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn call(&self, tool: &str, arguments: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = RpcRequest::tool_call(id, tool, arguments);
        let url = format!("{}/mcp", self.endpoint.base_url);

        let mut builder = self.http.post(&url).json(&request);
        if let Some(key) = &self.endpoint.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {}", e)))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::connection_refused(
                "http",
                format!("authentication rejected ({})", status),
            ));
        }
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "http status {}: {}",
                status,
                body.chars().take(120).collect::<String>()
            )));
        }

        let response: RpcResponse = serde_json::from_str(&body)
            .map_err(|e| Error::malformed_response(e.to_string(), &body))?;
        response.into_payload()
    }

    async fn healthcheck(&self) -> Result<()> {
        // Health is deliberately unauthenticated on the service side.
        let url = format!("{}/api/health", self.endpoint.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::connection_refused(
                "http",
                format!("health check returned {}", status),
            ));
        }
        Ok(())
    }

    async fn close(&self) {
        // Nothing held open beyond the connection pool.
    }
}

// ---------------------------------------------------------------------------
// in-memory transport
// ---------------------------------------------------------------------------

/// Loopback memory service used by tests and local development.
///
/// Shared behind an `Arc` so a test can connect through the negotiator and
/// still inspect handshake counts and stored records.
#[derive(Default)]
pub struct InMemoryService {
    records: Mutex<Vec<MemoryRecord>>,
    handshakes: AtomicUsize,
    fail_connect: AtomicBool,
    connect_delay_ms: AtomicU64,
}

impl InMemoryService {
    /// Create an empty service.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent connect attempts fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Delay each connect attempt, to widen concurrency windows in tests.
    pub fn set_connect_delay_ms(&self, delay: u64) {
        self.connect_delay_ms.store(delay, Ordering::Relaxed);
    }

    /// Number of handshake attempts made against this service.
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::Relaxed)
    }

    /// Seed a record directly.
    pub async fn seed(&self, record: MemoryRecord) {
        self.records.lock().await.push(record);
    }

    /// Stored record count.
    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }

    async fn connect(self: Arc<Self>) -> Result<InMemoryTransport> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);

        let delay = self.connect_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(Error::connection_refused(
                "in_memory",
                "configured to refuse connections",
            ));
        }
        Ok(InMemoryTransport { service: self })
    }
}

/// Transport over an [`InMemoryService`].
pub struct InMemoryTransport {
    service: Arc<InMemoryService>,
}

impl InMemoryTransport {
    async fn retrieve(&self, query: &str, limit: usize) -> Value {
        let query_words: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let records = self.service.records.lock().await;
        let mut scored: Vec<MemoryRecord> = records
            .iter()
            .filter_map(|r| {
                if query_words.is_empty() {
                    return None;
                }
                let content = r.content.to_lowercase();
                let hits = query_words.iter().filter(|w| content.contains(*w)).count();
                if hits == 0 {
                    return None;
                }
                let mut hit = r.clone();
                hit.similarity_score = Some(hits as f64 / query_words.len() as f64);
                Some(hit)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);

        let total = scored.len();
        json!({ "memories": scored, "total_results": total })
    }

    async fn recall(&self, limit: usize) -> Value {
        let records = self.service.records.lock().await;
        let mut recent: Vec<MemoryRecord> = records.clone();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit);
        let total = recent.len();
        json!({ "memories": recent, "total_results": total })
    }

    async fn search_by_tag(&self, tags: &[String], limit: usize) -> Value {
        let records = self.service.records.lock().await;
        let mut hits: Vec<MemoryRecord> = records
            .iter()
            .filter(|r| r.tags.iter().any(|t| tags.contains(t)))
            .cloned()
            .collect();
        hits.truncate(limit);
        let total = hits.len();
        json!({ "memories": hits, "total_results": total })
    }

    async fn store(&self, arguments: &Value) -> Result<Value> {
        let content = arguments
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Transport("store_memory requires content".to_string()))?;
        let metadata = arguments.get("metadata").cloned().unwrap_or(json!({}));
        let tags: Vec<String> = metadata
            .get("tags")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let hash = content_hash(content, &tags);
        let mut records = self.service.records.lock().await;
        if !records.iter().any(|r| r.content_hash == hash) {
            let mut record = MemoryRecord::new(content, tags);
            if let Some(t) = metadata.get("type").and_then(Value::as_str) {
                record.memory_type = Some(t.to_string());
            }
            records.push(record);
        }

        Ok(json!({ "success": true, "content_hash": hash }))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn protocol(&self) -> Protocol {
        Protocol::InMemory
    }

    async fn call(&self, tool: &str, arguments: Value) -> Result<Value> {
        let limit = arguments
            .get("n_results")
            .and_then(Value::as_u64)
            .unwrap_or(5) as usize;

        match tool {
            tools::RETRIEVE => {
                let query = arguments.get("query").and_then(Value::as_str).unwrap_or("");
                Ok(self.retrieve(query, limit).await)
            }
            tools::RECALL => Ok(self.recall(limit).await),
            tools::SEARCH_BY_TAG => {
                let tags: Vec<String> = arguments
                    .get("tags")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(self.search_by_tag(&tags, limit).await)
            }
            tools::STORE => self.store(&arguments).await,
            tools::HEALTH => {
                let total = self.service.record_count().await;
                Ok(json!({
                    "status": "healthy",
                    "backend": "in_memory",
                    "statistics": { "total_memories": total }
                }))
            }
            other => Err(Error::Transport(format!(
                "service error -32601: Tool not found: {}",
                other
            ))),
        }
    }

    async fn healthcheck(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}
