//! JSON wire protocol for whiteboard clients.
//!
//! Wire format (one JSON object per frame):
//! ```text
//! client → server   {"type":"draw","data":{"points":[[x,y,w,"color"],..]},"sender_id":"s"}
//!                   {"type":"clear","sender_id":"s"}
//!                   {"type":"cursor","data":{..},"sender_id":"s"}
//!                   {"type":"connect","data":{"last_timestamp":T},"sender_id":"s"}
//!
//! server → client   {"type":"sync","data":{"actions":[..],"last_clear_timestamp":T}}
//!                   {"type":"draw","data":{"points":[..],"timestamp":T,"session_id":"s"}}
//!                   {"type":"clear","timestamp":T}
//!                   {"type":"cursor","data":{..},"session_id":"s"}
//!                   {"type":"error","data":{"code":"..","message":"..","retryable":true}}
//! ```
//!
//! Frames are decoded once into the closed [`ClientMessage`] enum; everything
//! past this module matches on variants, never on raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Server-assigned event time: microseconds since the Unix epoch.
pub type Timestamp = u64;

/// Sentinel for "no clear yet" and "first-time client".
pub const EPOCH_ZERO: Timestamp = 0;

/// Client-asserted or server-generated session identity.
pub type SessionId = String;

/// One pen sample, serialized as `[x, y, width, color]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point(pub i64, pub i64, pub i64, pub String);

impl Point {
    pub fn new(x: i64, y: i64, width: i64, color: impl Into<String>) -> Self {
        Self(x, y, width, color.into())
    }
}

/// A committed stroke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawAction {
    pub points: Vec<Point>,
    pub timestamp: Timestamp,
    pub session_id: SessionId,
}

/// A committed canvas reset. Replay skips draws older than `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearEvent {
    pub timestamp: Timestamp,
    pub session_id: SessionId,
}

/// Payload of an inbound draw frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrokeData {
    pub points: Vec<Point>,
}

/// Payload of the optional handshake frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectData {
    #[serde(default)]
    pub last_timestamp: Option<Timestamp>,
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Connect {
        #[serde(default)]
        data: Option<ConnectData>,
        #[serde(default)]
        sender_id: Option<SessionId>,
    },
    Draw {
        data: StrokeData,
        #[serde(default)]
        sender_id: Option<SessionId>,
    },
    Clear {
        #[serde(default)]
        sender_id: Option<SessionId>,
    },
    Cursor {
        #[serde(default)]
        data: Value,
        #[serde(default)]
        sender_id: Option<SessionId>,
    },
}

impl ClientMessage {
    pub fn connect(sender_id: impl Into<SessionId>, last_timestamp: Timestamp) -> Self {
        Self::Connect {
            data: Some(ConnectData {
                last_timestamp: Some(last_timestamp),
            }),
            sender_id: Some(sender_id.into()),
        }
    }

    pub fn draw(sender_id: impl Into<SessionId>, points: Vec<Point>) -> Self {
        Self::Draw {
            data: StrokeData { points },
            sender_id: Some(sender_id.into()),
        }
    }

    pub fn clear(sender_id: impl Into<SessionId>) -> Self {
        Self::Clear {
            sender_id: Some(sender_id.into()),
        }
    }

    pub fn cursor(sender_id: impl Into<SessionId>, data: Value) -> Self {
        Self::Cursor {
            data,
            sender_id: Some(sender_id.into()),
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Draw { .. } => "draw",
            Self::Clear { .. } => "clear",
            Self::Cursor { .. } => "cursor",
        }
    }

    pub fn sender_id(&self) -> Option<&str> {
        match self {
            Self::Connect { sender_id, .. }
            | Self::Draw { sender_id, .. }
            | Self::Clear { sender_id }
            | Self::Cursor { sender_id, .. } => sender_id.as_deref(),
        }
    }

    /// Decode one complete frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let frame = frame.trim();
        if frame.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Body of the sync frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncData {
    pub actions: Vec<DrawAction>,
    pub last_clear_timestamp: Timestamp,
}

/// Body of the error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Sync { data: SyncData },
    Draw { data: DrawAction },
    Clear { timestamp: Timestamp },
    Cursor { data: Value, session_id: SessionId },
    Error { data: ErrorData },
}

impl ServerMessage {
    pub fn sync(actions: Vec<DrawAction>, last_clear_timestamp: Timestamp) -> Self {
        Self::Sync {
            data: SyncData {
                actions,
                last_clear_timestamp,
            },
        }
    }

    /// Tell the origin its event was not committed and may be resent.
    pub fn not_committed(message: impl Into<String>) -> Self {
        Self::Error {
            data: ErrorData {
                code: "not_committed".into(),
                message: message.into(),
                retryable: true,
            },
        }
    }

    /// Log timestamp this frame carries, if it represents a logged event.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Draw { data } => Some(data.timestamp),
            Self::Clear { timestamp } => Some(*timestamp),
            Self::Sync { data } => data
                .actions
                .last()
                .map(|a| a.timestamp)
                .max(Some(data.last_clear_timestamp)),
            Self::Cursor { .. } | Self::Error { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame.trim()).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_draw_frame() {
        let frame = r#"{"type":"draw","data":{"points":[[1,2,5,"black"]]},"sender_id":"alice"}"#;
        let msg = ClientMessage::decode(frame).unwrap();
        assert_eq!(
            msg,
            ClientMessage::draw("alice", vec![Point::new(1, 2, 5, "black")])
        );
        assert_eq!(msg.kind(), "draw");
        assert_eq!(msg.sender_id(), Some("alice"));
    }

    #[test]
    fn test_decode_clear_with_null_data() {
        // Legacy clients send `"data": null` on clear.
        let frame = r#"{"type":"clear","data":null,"sender_id":"bob"}"#;
        assert_eq!(ClientMessage::decode(frame).unwrap(), ClientMessage::clear("bob"));
    }

    #[test]
    fn test_decode_draw_ignores_extra_fields() {
        let frame = r#"{"type":"draw","data":{"points":[[0,0,1,"red"]],"session_id":"x"},"sender_id":"x"}"#;
        match ClientMessage::decode(frame).unwrap() {
            ClientMessage::Draw { data, .. } => assert_eq!(data.points.len(), 1),
            other => panic!("expected draw, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_connect_defaults() {
        let msg = ClientMessage::decode(r#"{"type":"connect"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Connect {
                data: None,
                sender_id: None
            }
        );

        let msg = ClientMessage::decode(
            r#"{"type":"connect","data":{"last_timestamp":42},"sender_id":"carol"}"#,
        )
        .unwrap();
        assert_eq!(msg, ClientMessage::connect("carol", 42));
    }

    #[test]
    fn test_decode_cursor_keeps_payload() {
        let frame = r#"{"type":"cursor","data":{"x":10,"y":20},"sender_id":"dave"}"#;
        match ClientMessage::decode(frame).unwrap() {
            ClientMessage::Cursor { data, .. } => assert_eq!(data, json!({"x": 10, "y": 20})),
            other => panic!("expected cursor, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert_eq!(ClientMessage::decode("   "), Err(ProtocolError::EmptyFrame));
        assert!(matches!(
            ClientMessage::decode(r#"{"type":"draw","data":{"points":[[1,2"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::decode(r#"{"type":"teleport"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::decode(r#"{"type":"draw","data":{"points":[[1,2,3]]}}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_sync_frame_shape() {
        let action = DrawAction {
            points: vec![Point::new(1, 2, 5, "black")],
            timestamp: 7,
            session_id: "alice".into(),
        };
        let encoded = ServerMessage::sync(vec![action], 3).encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "sync",
                "data": {
                    "actions": [{"points": [[1, 2, 5, "black"]], "timestamp": 7, "session_id": "alice"}],
                    "last_clear_timestamp": 3
                }
            })
        );
    }

    #[test]
    fn test_empty_sync_frame_shape() {
        let encoded = ServerMessage::sync(Vec::new(), EPOCH_ZERO).encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({"type": "sync", "data": {"actions": [], "last_clear_timestamp": 0}})
        );
    }

    #[test]
    fn test_clear_broadcast_shape() {
        let encoded = ServerMessage::Clear { timestamp: 99 }.encode().unwrap();
        assert_eq!(encoded, r#"{"type":"clear","timestamp":99}"#);
    }

    #[test]
    fn test_server_message_timestamps() {
        assert_eq!(ServerMessage::Clear { timestamp: 5 }.timestamp(), Some(5));
        assert_eq!(ServerMessage::not_committed("x").timestamp(), None);
        assert_eq!(ServerMessage::sync(Vec::new(), 4).timestamp(), Some(4));

        let action = DrawAction {
            points: Vec::new(),
            timestamp: 10,
            session_id: "s".into(),
        };
        assert_eq!(ServerMessage::sync(vec![action], 4).timestamp(), Some(10));
    }

    #[test]
    fn test_error_frame_is_retryable() {
        match ServerMessage::not_committed("store unavailable") {
            ServerMessage::Error { data } => {
                assert_eq!(data.code, "not_committed");
                assert!(data.retryable);
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }
}
