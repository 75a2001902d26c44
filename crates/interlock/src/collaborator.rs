//! Collaborator contracts: how the mesh reaches persistence and listeners.
//!
//! The mesh never touches storage or HTTP/WebSocket transports directly. A
//! [`SignalRecorder`] receives every accepted signal through the router's
//! observer hook, and an [`EventSink`] receives liveness events plus a relay of
//! mesh traffic.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::signal::Signal;

/// Event type names passed to [`EventSink::emit`].
pub mod events {
    pub const SIGNAL: &str = "signal";
    pub const PEER_RECOVERED: &str = "peer_recovered";
    pub const PEER_INACTIVE: &str = "peer_inactive";
    pub const RECOVERY_EXHAUSTED: &str = "recovery_exhausted";
    pub const MESH_STARTED: &str = "mesh_started";
    pub const MESH_STOPPED: &str = "mesh_stopped";
}

/// An accepted signal as handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedSignal {
    pub signal_type: String,
    pub code: u16,
    pub sender: Option<String>,
    pub source: String,
    pub timestamp: u32,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl RecordedSignal {
    pub fn new(signal: &Signal, source: SocketAddr) -> Self {
        Self {
            signal_type: signal.kind.name().to_string(),
            code: signal.kind.code(),
            sender: signal.sender.clone(),
            source: source.to_string(),
            timestamp: signal.timestamp,
            payload: signal.payload.clone(),
            received_at: Utc::now(),
        }
    }
}

/// Persists observed signals. Called synchronously from dispatch, so slow
/// implementations should hand work to a [`WorkQueue`](crate::queue::WorkQueue).
pub trait SignalRecorder: Send + Sync {
    fn record(&self, event: &RecordedSignal) -> anyhow::Result<()>;
}

/// Relays mesh activity to external consumers.
pub trait EventSink: Send + Sync {
    fn emit(&self, event_type: &str, data: serde_json::Value);
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Keeps recorded signals in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    events: Arc<Mutex<Vec<RecordedSignal>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedSignal> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl SignalRecorder for MemoryRecorder {
    fn record(&self, event: &RecordedSignal) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// An event as published by [`BroadcastSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshEvent {
    pub event_type: String,
    pub data: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Fans events out over a tokio broadcast channel, e.g. to WebSocket
/// sessions. Emitting with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<MeshEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event_type: &str, data: serde_json::Value) {
        let _ = self.tx.send(MeshEvent {
            event_type: event_type.to_string(),
            data,
            at: Utc::now(),
        });
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event_type: &str, _data: serde_json::Value) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalType;

    fn addr() -> SocketAddr {
        "127.0.0.1:3001".parse().unwrap()
    }

    #[test]
    fn test_recorded_signal_from_signal() {
        let signal = Signal::new(
            SignalType::FileIndexed,
            serde_json::json!({"sender": "indexer", "path": "/a"}),
        );
        let recorded = RecordedSignal::new(&signal, addr());
        assert_eq!(recorded.signal_type, "FILE_INDEXED");
        assert_eq!(recorded.code, 0x11);
        assert_eq!(recorded.sender.as_deref(), Some("indexer"));
        assert_eq!(recorded.source, "127.0.0.1:3001");
    }

    #[test]
    fn test_memory_recorder_shares_state_between_clones() {
        let recorder = MemoryRecorder::new();
        let clone = recorder.clone();
        let signal = Signal::new(SignalType::Ping, serde_json::json!({}));
        clone.record(&RecordedSignal::new(&signal, addr())).unwrap();
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.events()[0].signal_type, "PING");
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        sink.emit(events::MESH_STARTED, serde_json::json!({"dropped": true}));

        let mut rx = sink.subscribe();
        sink.emit(events::PEER_RECOVERED, serde_json::json!({"peer": "search"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "peer_recovered");
        assert_eq!(event.data["peer"], "search");
    }
}
