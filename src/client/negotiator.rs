//! Connection establishment and protocol selection.
//!
//! The negotiator owns the lifecycle of exactly one live transport. All
//! connect attempts serialize on an async mutex so concurrent callers can
//! never race two handshakes; late arrivals observe the connection the
//! first caller established and return immediately.

use crate::client::transport::{Protocol, Transport, TransportEndpoint};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, ClientEventType, EventSender};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lifecycle of the negotiated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Which candidates a connect attempt may try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// Try every configured candidate in preference order
    #[default]
    Auto,
    /// Only subprocess candidates
    McpOnly,
    /// Only HTTP candidates
    HttpOnly,
}

impl ConnectMode {
    fn admits(&self, protocol: Protocol) -> bool {
        match self {
            Self::Auto => true,
            Self::McpOnly => protocol == Protocol::Mcp,
            Self::HttpOnly => protocol == Protocol::Http,
        }
    }
}

/// Snapshot of the negotiated connection, for status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub protocol: Option<Protocol>,
    /// Human-readable description of the connected endpoint
    pub endpoint: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            protocol: None,
            endpoint: None,
            last_health_check: None,
        }
    }
}

struct Inner {
    transport: Option<Arc<dyn Transport>>,
    info: ConnectionInfo,
}

/// Default budget for a single connection handshake.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Establishes and caches a connection over the configured candidates.
pub struct ConnectionNegotiator {
    inner: Mutex<Inner>,
    endpoints: Vec<TransportEndpoint>,
    preferred: Option<Protocol>,
    connect_timeout_ms: u64,
    events: Option<EventSender>,
}

impl ConnectionNegotiator {
    /// Create a negotiator over the given candidates. Candidate order is
    /// the fallback order; `preferred` hoists one protocol to the front.
    pub fn new(endpoints: Vec<TransportEndpoint>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                transport: None,
                info: ConnectionInfo::default(),
            }),
            endpoints,
            preferred: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            events: None,
        }
    }

    /// Try this protocol's candidates before the rest.
    pub fn with_preferred(mut self, protocol: Protocol) -> Self {
        self.preferred = Some(protocol);
        self
    }

    /// Override the per-candidate handshake budget.
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Emit connection state changes to this channel.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Candidates admitted by `mode`, preferred protocol first, otherwise
    /// in configuration order.
    fn candidates(&self, mode: ConnectMode) -> Vec<&TransportEndpoint> {
        let mut ordered: Vec<&TransportEndpoint> = self
            .endpoints
            .iter()
            .filter(|e| mode.admits(e.protocol()))
            .collect();
        if let Some(preferred) = self.preferred {
            ordered.sort_by_key(|e| if e.protocol() == preferred { 0 } else { 1 });
        }
        ordered
    }

    fn emit_state(&self, state: ConnectionState, detail: &str) {
        if let Some(events) = &self.events {
            events.emit(
                ClientEvent::new(ClientEventType::ConnectionState, state.to_string())
                    .with_metadata("detail", detail),
            );
        }
    }

    /// Connect, or return immediately if already connected.
    ///
    /// Attempts serialize: when several tasks call this concurrently, one
    /// performs the handshakes and the rest wait on the lock, then observe
    /// the established connection.
    pub async fn connect(&self, mode: ConnectMode) -> Result<Arc<dyn Transport>> {
        let mut inner = self.inner.lock().await;
        if let Some(transport) = &inner.transport {
            return Ok(transport.clone());
        }

        inner.info.state = ConnectionState::Connecting;
        self.emit_state(ConnectionState::Connecting, "");

        let candidates = self.candidates(mode);
        if candidates.is_empty() {
            inner.info.state = ConnectionState::Failed;
            return Err(Error::Config(
                "no connection candidates configured for this mode".to_string(),
            ));
        }

        let mut last_error: Option<Error> = None;
        for endpoint in candidates {
            let protocol = endpoint.protocol();
            tracing::debug!(%protocol, "attempting connection");

            match endpoint.connect(self.connect_timeout_ms).await {
                Ok(transport) => {
                    let transport: Arc<dyn Transport> = Arc::from(transport);
                    inner.info = ConnectionInfo {
                        state: ConnectionState::Connected,
                        protocol: Some(protocol),
                        endpoint: Some(endpoint.describe()),
                        last_health_check: Some(Utc::now()),
                    };
                    inner.transport = Some(transport.clone());
                    tracing::info!(%protocol, "connected to memory service");
                    self.emit_state(ConnectionState::Connected, &protocol.to_string());
                    return Ok(transport);
                }
                Err(e) => {
                    tracing::warn!(%protocol, error = %e, "connection attempt failed");
                    last_error = Some(e);
                }
            }
        }

        inner.info.state = ConnectionState::Failed;
        let error = last_error
            .unwrap_or_else(|| Error::Internal("connection attempts exhausted".to_string()));
        self.emit_state(ConnectionState::Failed, &error.to_string());
        Err(error)
    }

    /// Close the live transport, if any, and reset to disconnected.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(transport) = inner.transport.take() {
            transport.close().await;
        }
        inner.info = ConnectionInfo::default();
        self.emit_state(ConnectionState::Disconnected, "");
    }

    /// The live transport, if connected.
    pub async fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.lock().await.transport.clone()
    }

    /// Snapshot of connection state.
    pub async fn info(&self) -> ConnectionInfo {
        self.inner.lock().await.info.clone()
    }

    /// Probe the live transport. Records the probe time on success.
    pub async fn is_healthy(&self) -> bool {
        let transport = {
            let inner = self.inner.lock().await;
            match &inner.transport {
                Some(t) => t.clone(),
                None => return false,
            }
        };
        match transport.healthcheck().await {
            Ok(()) => {
                self.inner.lock().await.info.last_health_check = Some(Utc::now());
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::{InMemoryService, StdioEndpoint};
    use futures::future::join_all;

    #[tokio::test]
    async fn test_connect_returns_cached_transport() {
        let service = InMemoryService::new();
        let negotiator =
            ConnectionNegotiator::new(vec![TransportEndpoint::InMemory(service.clone())]);

        negotiator.connect(ConnectMode::Auto).await.unwrap();
        negotiator.connect(ConnectMode::Auto).await.unwrap();

        assert_eq!(service.handshake_count(), 1);
        assert_eq!(negotiator.info().await.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_connects_handshake_once() {
        let service = InMemoryService::new();
        service.set_connect_delay_ms(20);
        let negotiator = Arc::new(ConnectionNegotiator::new(vec![
            TransportEndpoint::InMemory(service.clone()),
        ]));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let negotiator = negotiator.clone();
                tokio::spawn(async move { negotiator.connect(ConnectMode::Auto).await.is_ok() })
            })
            .collect();

        for outcome in join_all(tasks).await {
            assert!(outcome.unwrap());
        }
        assert_eq!(service.handshake_count(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_next_candidate() {
        let service = InMemoryService::new();
        let negotiator = ConnectionNegotiator::new(vec![
            TransportEndpoint::Stdio(StdioEndpoint::new("definitely-not-a-real-binary", vec![])),
            TransportEndpoint::InMemory(service.clone()),
        ])
        .with_connect_timeout_ms(500);

        let transport = negotiator.connect(ConnectMode::Auto).await.unwrap();
        assert_eq!(transport.protocol(), Protocol::InMemory);

        let info = negotiator.info().await;
        assert_eq!(info.state, ConnectionState::Connected);
        assert_eq!(info.protocol, Some(Protocol::InMemory));
        assert_eq!(info.endpoint.as_deref(), Some("in-memory"));
    }

    #[tokio::test]
    async fn test_all_candidates_fail() {
        let service = InMemoryService::new();
        service.set_fail_connect(true);
        let negotiator =
            ConnectionNegotiator::new(vec![TransportEndpoint::InMemory(service.clone())]);

        let err = negotiator.connect(ConnectMode::Auto).await.err().unwrap();
        assert!(matches!(err, Error::ConnectionRefused { .. }));
        assert_eq!(negotiator.info().await.state, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_mode_filters_candidates() {
        let service = InMemoryService::new();
        let negotiator =
            ConnectionNegotiator::new(vec![TransportEndpoint::InMemory(service.clone())]);

        let err = negotiator.connect(ConnectMode::HttpOnly).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(service.handshake_count(), 0);
    }

    #[tokio::test]
    async fn test_preferred_protocol_ordering() {
        let first = InMemoryService::new();
        first.set_fail_connect(true);
        let negotiator = ConnectionNegotiator::new(vec![
            TransportEndpoint::InMemory(first.clone()),
            TransportEndpoint::Http(crate::client::transport::HttpEndpoint::new(
                "http://127.0.0.1:1",
            )),
        ])
        .with_preferred(Protocol::Http)
        .with_connect_timeout_ms(200);

        // Both candidates fail, but the HTTP one is tried first, so the
        // in-memory service sees its handshake only after HTTP falls over.
        let _ = negotiator.connect(ConnectMode::Auto).await;
        assert_eq!(first.handshake_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_resets_state() {
        let service = InMemoryService::new();
        let negotiator =
            ConnectionNegotiator::new(vec![TransportEndpoint::InMemory(service.clone())]);

        negotiator.connect(ConnectMode::Auto).await.unwrap();
        assert!(negotiator.is_healthy().await);

        negotiator.disconnect().await;
        assert!(negotiator.transport().await.is_none());
        assert_eq!(
            negotiator.info().await.state,
            ConnectionState::Disconnected
        );
        assert!(!negotiator.is_healthy().await);

        // Reconnect performs a fresh handshake.
        negotiator.connect(ConnectMode::Auto).await.unwrap();
        assert_eq!(service.handshake_count(), 2);
    }
}
