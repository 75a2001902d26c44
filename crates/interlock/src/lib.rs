//! InterLock: a UDP signal mesh between cooperating servers.
//!
//! Each server runs one [`MeshTransport`]. Servers exchange small typed
//! [`Signal`]s (heartbeats, discovery, shutdown notices, application events)
//! as single datagrams, admit them through a per-server whitelist (the
//! [`Tumbler`]), and dispatch the accepted ones to registered handlers.
//!
//! # Architecture
//!
//! - **Wire**: 12-byte big-endian header followed by a JSON payload, with a
//!   fallback for the legacy `{"type", "data"}` JSON form.
//! - **Tumbler**: whitelist filter with accept/reject statistics.
//! - **Peers**: registry of known servers, liveness sweep and recovery
//!   probes with exponential backoff.
//! - **Routing**: observer and per-type handlers, each isolated from the
//!   others' failures.
//! - **Transport**: the UDP socket plus receive, heartbeat and maintenance
//!   loops.
//!
//! Delivery is best-effort. There is no retransmission, ordering or
//! authentication; signals are hints between trusted servers.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use interlock::{MeshConfig, MeshTransport, SignalType};
//! use interlock::config::PeerConfig;
//!
//! # async fn example() -> Result<(), interlock::MeshError> {
//! let mut config = MeshConfig::named("search");
//! config.accepted_signals = vec!["heartbeat".into(), "FILE_INDEXED".into()];
//! config.peers = vec![PeerConfig::new("indexer", "127.0.0.1", 3002)];
//!
//! let mut mesh = MeshTransport::new(config);
//! mesh.on_signal(SignalType::FileIndexed, |signal, _from| {
//!     tracing::info!("indexed: {}", signal.payload);
//!     Ok(())
//! })
//! .await;
//!
//! mesh.start().await?;
//! mesh.send("indexer", SignalType::SearchStarted, serde_json::json!({"q": "rust"}))
//!     .await?;
//! mesh.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod collaborator;
pub mod config;
pub mod error;
pub mod peer;
pub mod queue;
pub mod router;
pub mod signal;
pub mod transport;
pub mod tumbler;
pub mod wire;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use collaborator::{BroadcastSink, EventSink, MemoryRecorder, RecordedSignal, SignalRecorder};
pub use config::{MeshConfig, UnknownPeerPolicy};
pub use error::MeshError;
pub use peer::{Peer, PeerRegistry, PeerStatus};
pub use queue::WorkQueue;
pub use router::SignalRouter;
pub use signal::{Signal, SignalType};
pub use transport::{BroadcastReport, MeshHandle, MeshState, MeshTransport};
pub use tumbler::{Tumbler, TumblerStats, Verdict};
pub use wire::WireError;
