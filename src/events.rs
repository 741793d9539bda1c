//! Observable events for external collaborators.
//!
//! Trigger verdicts, connection state transitions, and analyzer latency
//! samples are surfaced through a bounded channel so that logging,
//! metrics, and adaptive profile tuning can live outside this crate.
//! Emission never blocks: if the channel is full the event is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Kind of emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEventType {
    /// A trigger/skip verdict was produced
    TriggerVerdict,
    /// The connection changed state
    ConnectionState,
    /// An analysis completed; carries its latency
    AnalyzerLatency,
}

impl std::fmt::Display for ClientEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TriggerVerdict => write!(f, "trigger_verdict"),
            Self::ConnectionState => write!(f, "connection_state"),
            Self::AnalyzerLatency => write!(f, "analyzer_latency"),
        }
    }
}

/// A single observable event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEvent {
    /// Event kind
    pub event_type: ClientEventType,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// Human-readable summary
    pub content: String,
    /// Structured metadata
    pub metadata: HashMap<String, Value>,
}

impl ClientEvent {
    /// Create a new event.
    pub fn new(event_type: ClientEventType, content: impl Into<String>) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Non-blocking sender for client events.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ClientEvent>,
}

impl EventSender {
    /// Create a bounded event channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Emit an event. Drops it (with a debug log) if the channel is full
    /// or closed; observability must not stall the caller.
    pub fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!("event dropped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let (sender, mut rx) = EventSender::channel(4);
        sender.emit(
            ClientEvent::new(ClientEventType::TriggerVerdict, "triggered")
                .with_metadata("confidence", 0.84),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, ClientEventType::TriggerVerdict);
        assert_eq!(event.metadata["confidence"], 0.84);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (sender, _rx) = EventSender::channel(1);
        sender.emit(ClientEvent::new(ClientEventType::AnalyzerLatency, "a"));
        // Second emit must not block even though the channel is full.
        sender.emit(ClientEvent::new(ClientEventType::AnalyzerLatency, "b"));
    }
}
