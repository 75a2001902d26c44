//! Mesh error types.

use std::net::SocketAddr;

use crate::wire::WireError;

/// Errors surfaced by the mesh.
///
/// Only [`MeshError::Bind`] is fatal, and only to [`MeshTransport::start`](crate::transport::MeshTransport::start).
/// Everything else is a diagnostic the caller may log and ignore.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// The UDP socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A datagram could not be sent.
    #[error("Send to {peer} ({addr}) failed: {reason}")]
    Transport {
        peer: String,
        addr: String,
        reason: String,
    },

    /// The named peer is not registered.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// A frame could not be encoded.
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// The operation needs a running mesh.
    #[error("Mesh not running")]
    NotRunning,

    /// `start()` was called while the mesh was not stopped.
    #[error("Mesh already started (state: {0})")]
    AlreadyStarted(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    pub(crate) fn transport(peer: &str, addr: impl ToString, reason: impl ToString) -> Self {
        Self::Transport {
            peer: peer.to_string(),
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}
