//! Signal types: the closed, extensible enumeration carried on the mesh.
//!
//! Every datagram exchanged between servers is a [`Signal`] tagged with a
//! [`SignalType`]. Known codes map to named variants; anything else decodes to
//! [`SignalType::Unknown`] and is still routed, so newer peers can introduce
//! codes without breaking older ones.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::wire::PROTOCOL_VERSION;

/// The type code of a [`Signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalType {
    // ── Mesh control ────────────────────────────────────────────────
    DockRequest,
    DockApproved,
    Undock,
    Heartbeat,
    Discovery,
    Ready,
    Shutdown,

    // ── Files ───────────────────────────────────────────────────────
    FileDiscovered,
    FileIndexed,
    FileModified,
    FileDeleted,

    // ── Search ──────────────────────────────────────────────────────
    SearchStarted,
    SearchCompleted,
    SearchResult,

    // ── Build ───────────────────────────────────────────────────────
    BuildStarted,
    BuildCompleted,
    BuildFailed,

    // ── Verification / validation ───────────────────────────────────
    VerificationStarted,
    VerificationResult,
    ClaimExtracted,
    ValidationApproved,
    ValidationRejected,

    // ── Handoff ─────────────────────────────────────────────────────
    HandoffRequest,
    HandoffApproved,
    HandoffCompleted,
    ModeSwitch,

    // ── Deployment-specific ─────────────────────────────────────────
    ExportStarted,
    ExportCompleted,
    VideoProcessed,
    WorkflowStarted,
    WorkflowCompleted,
    NotionSynced,

    // ── Generic ─────────────────────────────────────────────────────
    Ping,
    Pong,
    Error,

    /// A code this build does not know about. Code 0 is the canonical
    /// "unknown" produced by unresolved legacy names.
    Unknown(u16),
}

impl SignalType {
    /// Every named variant, in code order.
    pub const ALL: &'static [SignalType] = &[
        Self::DockRequest,
        Self::DockApproved,
        Self::Undock,
        Self::Heartbeat,
        Self::Discovery,
        Self::Ready,
        Self::Shutdown,
        Self::FileDiscovered,
        Self::FileIndexed,
        Self::FileModified,
        Self::FileDeleted,
        Self::SearchStarted,
        Self::SearchCompleted,
        Self::SearchResult,
        Self::BuildStarted,
        Self::BuildCompleted,
        Self::BuildFailed,
        Self::VerificationStarted,
        Self::VerificationResult,
        Self::ClaimExtracted,
        Self::ValidationApproved,
        Self::ValidationRejected,
        Self::HandoffRequest,
        Self::HandoffApproved,
        Self::HandoffCompleted,
        Self::ModeSwitch,
        Self::ExportStarted,
        Self::ExportCompleted,
        Self::VideoProcessed,
        Self::WorkflowStarted,
        Self::WorkflowCompleted,
        Self::NotionSynced,
        Self::Ping,
        Self::Pong,
        Self::Error,
    ];

    /// The numeric wire code.
    pub fn code(self) -> u16 {
        match self {
            Self::DockRequest => 0x01,
            Self::DockApproved => 0x02,
            Self::Undock => 0x03,
            Self::Heartbeat => 0x04,
            Self::Discovery => 0x05,
            Self::Ready => 0x06,
            Self::Shutdown => 0x07,
            Self::FileDiscovered => 0x10,
            Self::FileIndexed => 0x11,
            Self::FileModified => 0x12,
            Self::FileDeleted => 0x13,
            Self::SearchStarted => 0x20,
            Self::SearchCompleted => 0x21,
            Self::SearchResult => 0x22,
            Self::BuildStarted => 0x30,
            Self::BuildCompleted => 0x31,
            Self::BuildFailed => 0x32,
            Self::VerificationStarted => 0x40,
            Self::VerificationResult => 0x41,
            Self::ClaimExtracted => 0x42,
            Self::ValidationApproved => 0x50,
            Self::ValidationRejected => 0x51,
            Self::HandoffRequest => 0x60,
            Self::HandoffApproved => 0x61,
            Self::HandoffCompleted => 0x62,
            Self::ModeSwitch => 0x63,
            Self::ExportStarted => 0x70,
            Self::ExportCompleted => 0x71,
            Self::VideoProcessed => 0x72,
            Self::WorkflowStarted => 0x73,
            Self::WorkflowCompleted => 0x74,
            Self::NotionSynced => 0x75,
            Self::Ping => 0xF0,
            Self::Pong => 0xF1,
            Self::Error => 0xFF,
            Self::Unknown(code) => code,
        }
    }

    /// Symbolic name used for handler registration, statistics and the
    /// legacy JSON format.
    pub fn name(self) -> &'static str {
        match self {
            Self::DockRequest => "DOCK_REQUEST",
            Self::DockApproved => "DOCK_APPROVED",
            Self::Undock => "UNDOCK",
            Self::Heartbeat => "HEARTBEAT",
            Self::Discovery => "DISCOVERY",
            Self::Ready => "READY",
            Self::Shutdown => "SHUTDOWN",
            Self::FileDiscovered => "FILE_DISCOVERED",
            Self::FileIndexed => "FILE_INDEXED",
            Self::FileModified => "FILE_MODIFIED",
            Self::FileDeleted => "FILE_DELETED",
            Self::SearchStarted => "SEARCH_STARTED",
            Self::SearchCompleted => "SEARCH_COMPLETED",
            Self::SearchResult => "SEARCH_RESULT",
            Self::BuildStarted => "BUILD_STARTED",
            Self::BuildCompleted => "BUILD_COMPLETED",
            Self::BuildFailed => "BUILD_FAILED",
            Self::VerificationStarted => "VERIFICATION_STARTED",
            Self::VerificationResult => "VERIFICATION_RESULT",
            Self::ClaimExtracted => "CLAIM_EXTRACTED",
            Self::ValidationApproved => "VALIDATION_APPROVED",
            Self::ValidationRejected => "VALIDATION_REJECTED",
            Self::HandoffRequest => "HANDOFF_REQUEST",
            Self::HandoffApproved => "HANDOFF_APPROVED",
            Self::HandoffCompleted => "HANDOFF_COMPLETED",
            Self::ModeSwitch => "MODE_SWITCH",
            Self::ExportStarted => "EXPORT_STARTED",
            Self::ExportCompleted => "EXPORT_COMPLETED",
            Self::VideoProcessed => "VIDEO_PROCESSED",
            Self::WorkflowStarted => "WORKFLOW_STARTED",
            Self::WorkflowCompleted => "WORKFLOW_COMPLETED",
            Self::NotionSynced => "NOTION_SYNCED",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Error => "ERROR",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Map a wire code to a type. Never fails: unrecognised codes become
    /// [`SignalType::Unknown`].
    pub fn from_code(code: u16) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .unwrap_or(Self::Unknown(code))
    }

    /// Resolve a symbolic name. Case-insensitive; `-` and `_` are
    /// interchangeable, so `"heartbeat"`, `"HEARTBEAT"` and `"build-started"`
    /// all resolve.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().replace('-', "_").to_ascii_uppercase();
        Self::ALL.iter().copied().find(|t| t.name() == normalized)
    }

    /// Key used for per-type statistics. Unknown codes are disambiguated by
    /// their hex value.
    pub fn stats_key(self) -> String {
        match self {
            Self::Unknown(code) => format!("UNKNOWN(0x{code:02X})"),
            other => other.name().to_string(),
        }
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "UNKNOWN(0x{code:02X})"),
            other => f.write_str(other.name()),
        }
    }
}

impl From<u16> for SignalType {
    fn from(code: u16) -> Self {
        Self::from_code(code)
    }
}

/// Checked conversion from an arbitrary integer, used for codes that arrive
/// as text (configuration, CLI). Negative and out-of-range values are
/// rejected rather than truncated.
impl TryFrom<i64> for SignalType {
    type Error = crate::wire::WireError;

    fn try_from(value: i64) -> Result<Self, crate::wire::WireError> {
        u16::try_from(value)
            .map(Self::from_code)
            .map_err(|_| crate::wire::WireError::InvalidTypeCode(value))
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A decoded (or about to be encoded) mesh signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub kind: SignalType,
    pub version: u16,
    /// Unix seconds as carried on the wire.
    pub timestamp: u32,
    pub payload: serde_json::Value,
    /// Sender server name, when the payload carried one.
    pub sender: Option<String>,
}

impl Signal {
    /// Build a signal stamped with the current time.
    pub fn new(kind: SignalType, payload: serde_json::Value) -> Self {
        let sender = sender_from_payload(&payload);
        Self {
            kind,
            version: PROTOCOL_VERSION,
            timestamp: crate::wire::unix_timestamp(),
            payload,
            sender,
        }
    }

    /// Deserialize the payload into one of the typed payload structs.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Extract the `sender` field from an object payload.
pub(crate) fn sender_from_payload(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("sender")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// Payload of a periodic `HEARTBEAT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub sender: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub uptime_secs: u64,
}

/// Payload of a `DISCOVERY` announcement (also used as the recovery probe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub sender: String,
    #[serde(default)]
    pub instance_id: String,
    /// Port the sender listens on; lets receivers register it on first
    /// contact even when the datagram came from an ephemeral port.
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// The sender's Tumbler whitelist, by name. Empty means "everything".
    #[serde(default)]
    pub accepted_signals: Vec<String>,
    #[serde(default)]
    pub probe: bool,
}

/// Payload of a `SHUTDOWN` notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownPayload {
    pub sender: String,
    #[serde(default)]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
