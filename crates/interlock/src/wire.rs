//! Wire format for InterLock signals.
//!
//! Every datagram is a fixed 12-byte header followed by a compact UTF-8 JSON
//! payload. All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Signal Type          |       Protocol Version        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload Length                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Timestamp (unix seconds)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     JSON payload ...                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Older servers sent bare JSON documents shaped `{"type": "<name>", "data":
//! {...}}`. [`decode`] accepts those as a fallback when the binary frame does
//! not parse. Nothing here performs I/O.

use serde::Deserialize;

use crate::signal::{Signal, SignalType, sender_from_payload};

/// Byte length of the fixed-size header.
pub const HEADER_LEN: usize = 12;

/// Protocol version written into every frame.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest payload that still fits in a single UDP datagram with the header.
pub const MAX_PAYLOAD_LEN: usize = 65_507 - HEADER_LEN;

const OFF_TYPE: usize = 0;
const OFF_VERSION: usize = 2;
const OFF_PAYLOAD_LEN: usize = 4;
const OFF_TIMESTAMP: usize = 8;

/// Reasons a frame could not be encoded or decoded.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {len} bytes, header needs {HEADER_LEN}")]
    TooShort { len: usize },

    #[error("truncated payload: header declares {declared} bytes, {available} available")]
    Truncated { declared: usize, available: usize },

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid signal type code: {0}")]
    InvalidTypeCode(i64),

    #[error("legacy document has an unsupported shape: {0}")]
    UnsupportedLegacyShape(String),
}

/// Current time as 32-bit unix seconds.
///
/// The field overflows in February 2106. Clock values before the epoch or
/// past the rollover are clamped instead of wrapping.
pub fn unix_timestamp() -> u32 {
    let secs = chrono::Utc::now().timestamp();
    u32::try_from(secs.max(0)).unwrap_or(u32::MAX)
}

/// Encode a signal frame stamped with the current time.
///
/// When `payload` is a JSON object without a `sender` field and `sender` is
/// given, the sender name is inserted so receivers can attribute the frame.
pub fn encode(
    kind: SignalType,
    payload: &serde_json::Value,
    sender: Option<&str>,
) -> Result<Vec<u8>, WireError> {
    encode_at(kind, payload, sender, unix_timestamp())
}

/// Like [`encode`] with an explicit timestamp.
pub fn encode_at(
    kind: SignalType,
    payload: &serde_json::Value,
    sender: Option<&str>,
    timestamp: u32,
) -> Result<Vec<u8>, WireError> {
    let json = match (sender, payload.as_object()) {
        (Some(name), Some(map)) if !map.contains_key("sender") => {
            let mut map = map.clone();
            map.insert("sender".to_string(), serde_json::Value::from(name));
            serde_json::to_vec(&serde_json::Value::Object(map))?
        }
        _ => serde_json::to_vec(payload)?,
    };

    if json.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge {
            len: json.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let payload_len = u32::try_from(json.len()).map_err(|_| WireError::PayloadTooLarge {
        len: json.len(),
        max: MAX_PAYLOAD_LEN,
    })?;

    let mut buf = vec![0u8; HEADER_LEN + json.len()];
    buf[OFF_TYPE..OFF_TYPE + 2].copy_from_slice(&kind.code().to_be_bytes());
    buf[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 4].copy_from_slice(&payload_len.to_be_bytes());
    buf[OFF_TIMESTAMP..OFF_TIMESTAMP + 4].copy_from_slice(&timestamp.to_be_bytes());
    buf[HEADER_LEN..].copy_from_slice(&json);

    Ok(buf)
}

/// Encode an already-built [`Signal`], keeping its timestamp.
pub fn encode_signal(signal: &Signal) -> Result<Vec<u8>, WireError> {
    encode_at(
        signal.kind,
        &signal.payload,
        signal.sender.as_deref(),
        signal.timestamp,
    )
}

/// Decode a datagram, trying the binary frame first and the legacy JSON
/// document second. Returns `None` when neither parses; callers drop such
/// datagrams.
pub fn decode(buf: &[u8]) -> Option<Signal> {
    match decode_frame(buf) {
        Ok(signal) => Some(signal),
        Err(frame_err) => match decode_legacy(buf) {
            Ok(signal) => {
                tracing::trace!("Frame decode failed ({frame_err}), legacy decode succeeded");
                Some(signal)
            }
            Err(legacy_err) => {
                tracing::debug!(
                    "Dropping undecodable datagram ({} bytes): {frame_err}; legacy: {legacy_err}",
                    buf.len()
                );
                None
            }
        },
    }
}

/// Decode the binary frame format only.
///
/// Returns [`Err`] if:
/// - `buf` is shorter than [`HEADER_LEN`],
/// - the declared payload length exceeds the remaining bytes,
/// - the payload bytes are not valid JSON.
///
/// Bytes past the declared payload are ignored.
pub fn decode_frame(buf: &[u8]) -> Result<Signal, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::TooShort { len: buf.len() });
    }

    let code = u16::from_be_bytes([buf[OFF_TYPE], buf[OFF_TYPE + 1]]);
    let version = u16::from_be_bytes([buf[OFF_VERSION], buf[OFF_VERSION + 1]]);
    let declared = u32::from_be_bytes([
        buf[OFF_PAYLOAD_LEN],
        buf[OFF_PAYLOAD_LEN + 1],
        buf[OFF_PAYLOAD_LEN + 2],
        buf[OFF_PAYLOAD_LEN + 3],
    ]) as usize;
    let timestamp = u32::from_be_bytes([
        buf[OFF_TIMESTAMP],
        buf[OFF_TIMESTAMP + 1],
        buf[OFF_TIMESTAMP + 2],
        buf[OFF_TIMESTAMP + 3],
    ]);

    let available = buf.len() - HEADER_LEN;
    if declared > available {
        return Err(WireError::Truncated {
            declared,
            available,
        });
    }

    let payload: serde_json::Value = serde_json::from_slice(&buf[HEADER_LEN..HEADER_LEN + declared])?;
    let sender = sender_from_payload(&payload);

    Ok(Signal {
        kind: SignalType::from_code(code),
        version,
        timestamp,
        payload,
        sender,
    })
}

#[derive(Deserialize)]
struct LegacyDocument {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
    /// Optional extras; used only when they have the expected shape.
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
    #[serde(default)]
    sender: Option<serde_json::Value>,
}

/// Decode the legacy `{"type": "<name>", "data": {...}}` document.
///
/// Unresolvable names map to code 0 ([`SignalType::Unknown`]).
pub fn decode_legacy(buf: &[u8]) -> Result<Signal, WireError> {
    let doc: LegacyDocument = serde_json::from_slice(buf)?;

    let payload = match doc.data {
        None | Some(serde_json::Value::Null) => serde_json::Value::Object(Default::default()),
        Some(value @ serde_json::Value::Object(_)) => value,
        Some(other) => {
            return Err(WireError::UnsupportedLegacyShape(format!(
                "data must be an object, got {other}"
            )));
        }
    };

    let kind = SignalType::from_name(&doc.kind).unwrap_or(SignalType::Unknown(0));
    let sender = sender_from_payload(&payload).or_else(|| {
        doc.sender
            .as_ref()
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    });
    let timestamp = doc
        .timestamp
        .as_ref()
        .and_then(|v| v.as_u64())
        .and_then(|t| u32::try_from(t).ok())
        .unwrap_or_else(unix_timestamp);

    Ok(Signal {
        kind,
        version: PROTOCOL_VERSION,
        timestamp,
        payload,
        sender,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_layout_is_big_endian() {
        let buf = encode_at(SignalType::Heartbeat, &json!({}), None, 0x0102_0304).unwrap();
        assert_eq!(&buf[0..2], &[0x00, 0x04]);
        assert_eq!(&buf[2..4], &[0x00, 0x01]);
        assert_eq!(&buf[4..8], &[0x00, 0x00, 0x00, 0x02]);
        assert_eq!(&buf[8..12], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[12..], b"{}");
    }

    #[test]
    fn test_payload_length_matches_json_bytes() {
        let payload = json!({"path": "/srv/ünïcode.txt", "size": 42});
        let buf = encode(SignalType::FileIndexed, &payload, None).unwrap();
        let declared = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        assert_eq!(declared, buf.len() - HEADER_LEN);
        assert_eq!(declared, serde_json::to_vec(&payload).unwrap().len());
    }

    #[test]
    fn test_roundtrip_every_signal_type() {
        for kind in SignalType::ALL.iter().copied().chain([SignalType::Unknown(0x99)]) {
            let payload = json!({"n": kind.code(), "tags": ["a", "b"]});
            let buf = encode(kind, &payload, Some("indexer")).unwrap();
            let signal = decode(&buf).expect("frame decodes");

            assert_eq!(signal.kind, kind);
            assert_eq!(signal.version, PROTOCOL_VERSION);
            assert_eq!(signal.sender.as_deref(), Some("indexer"));
            assert_eq!(signal.payload["n"], payload["n"]);
            assert_eq!(signal.payload["tags"], payload["tags"]);
        }
    }

    #[test]
    fn test_existing_sender_is_not_overwritten() {
        let buf = encode(SignalType::Ping, &json!({"sender": "original"}), Some("other")).unwrap();
        let signal = decode_frame(&buf).unwrap();
        assert_eq!(signal.sender.as_deref(), Some("original"));
    }

    #[test]
    fn test_non_object_payload_carries_no_sender() {
        let buf = encode(SignalType::SearchResult, &json!([1, 2, 3]), Some("search")).unwrap();
        let signal = decode_frame(&buf).unwrap();
        assert_eq!(signal.payload, json!([1, 2, 3]));
        assert!(signal.sender.is_none());
    }

    #[test]
    fn test_short_prefixes_are_rejected() {
        let buf = encode(SignalType::Heartbeat, &json!({"sender": "a"}), None).unwrap();
        for len in 0..HEADER_LEN {
            assert!(matches!(
                decode_frame(&buf[..len]),
                Err(WireError::TooShort { .. })
            ));
            assert!(decode(&buf[..len]).is_none());
        }
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let buf = encode(SignalType::BuildStarted, &json!({"target": "release"}), None).unwrap();
        for len in HEADER_LEN..buf.len() {
            assert!(matches!(
                decode_frame(&buf[..len]),
                Err(WireError::Truncated { .. })
            ));
            assert!(decode(&buf[..len]).is_none(), "prefix of {len} bytes decoded");
        }
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let mut buf = encode(SignalType::Pong, &json!({"ok": true}), None).unwrap();
        buf.extend_from_slice(b"garbage");
        let signal = decode_frame(&buf).unwrap();
        assert_eq!(signal.payload, json!({"ok": true}));
    }

    #[test]
    fn test_invalid_json_payload_is_rejected() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[1] = 0x04;
        buf[7] = 3;
        buf.extend_from_slice(b"{x}");
        assert!(matches!(decode_frame(&buf), Err(WireError::InvalidJson(_))));
        assert!(decode(&buf).is_none());
    }

    #[test]
    fn test_oversized_payload_is_refused() {
        let big = "x".repeat(MAX_PAYLOAD_LEN);
        let err = encode(SignalType::SearchResult, &json!({"blob": big}), None).unwrap_err();
        assert!(matches!(err, WireError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_legacy_heartbeat_fallback() {
        let legacy = serde_json::to_vec(&json!({"type": "heartbeat", "data": {}})).unwrap();
        assert!(decode_frame(&legacy).is_err());

        let signal = decode(&legacy).expect("legacy decode");
        assert_eq!(signal.kind, SignalType::Heartbeat);
        assert_eq!(signal.version, PROTOCOL_VERSION);
        assert_eq!(signal.payload, json!({}));
    }

    #[test]
    fn test_legacy_unknown_name_maps_to_code_zero() {
        let legacy = br#"{"type": "telemetry_burst", "data": {"sender": "cam"}}"#;
        let signal = decode(legacy).unwrap();
        assert_eq!(signal.kind, SignalType::Unknown(0));
        assert_eq!(signal.sender.as_deref(), Some("cam"));
    }

    #[test]
    fn test_legacy_ignores_ill_typed_extras() {
        let millis = br#"{"type":"heartbeat","data":{},"timestamp":1700000000000,"sender":42}"#;
        let signal = decode(millis).expect("legacy decode");
        assert_eq!(signal.kind, SignalType::Heartbeat);
        assert_ne!(signal.timestamp, 0);
        assert!(signal.sender.is_none());

        let seconds = br#"{"type":"ready","data":{},"timestamp":1700000000,"sender":"api"}"#;
        let signal = decode(seconds).unwrap();
        assert_eq!(signal.timestamp, 1_700_000_000);
        assert_eq!(signal.sender.as_deref(), Some("api"));
    }

    #[test]
    fn test_legacy_rejects_non_object_data() {
        let legacy = br#"{"type": "heartbeat", "data": [1, 2]}"#;
        assert!(matches!(
            decode_legacy(legacy),
            Err(WireError::UnsupportedLegacyShape(_))
        ));
        assert!(decode(legacy).is_none());
    }

    #[test]
    fn test_garbage_returns_none() {
        assert!(decode(b"").is_none());
        assert!(decode(b"definitely not a frame").is_none());
        assert!(decode(&[0xFF; 40]).is_none());
    }

    #[test]
    fn test_encode_signal_keeps_timestamp() {
        let mut signal = Signal::new(SignalType::Ready, json!({"sender": "api"}));
        signal.timestamp = 1_700_000_000;
        let decoded = decode(&encode_signal(&signal).unwrap()).unwrap();
        assert_eq!(decoded, signal);
    }
}
