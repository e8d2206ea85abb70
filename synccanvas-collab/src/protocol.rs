//! Event payloads and the relay wire protocol.
//!
//! Broadcast payloads are JSON with camelCase fields so browser peers can
//! produce and consume them unchanged:
//!
//! ```text
//! document_change  { "userId": "…", "title": "…"?, "content": "<p>…</p>"? }
//! cursor_move      { "userId": "…", "userName": "…", "color": "hsl(…)", "pos": 10 }
//! ```
//!
//! Relay frames wrap those payloads (plus presence and subscription control)
//! and are bincode-encoded into WebSocket binary messages:
//!
//! ```text
//! client ── Subscribe{topic} ──────────► relay
//! client ◄───────────── Subscribed{topic}
//! client ◄───────────── PresenceSync{state}      (full set, every change)
//! client ── Track{entry} / Untrack ────►
//! client ── Broadcast{message} ────────►  ──► every other subscriber
//! client ── Unsubscribe ───────────────►
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::presence::{PresenceEntry, PresenceState};

/// Event name for full-snapshot document edits.
pub const DOCUMENT_CHANGE: &str = "document_change";
/// Event name for local selection moves.
pub const CURSOR_MOVE: &str = "cursor_move";

/// Channel topic for a document. One topic per document, so events never
/// cross documents.
pub fn topic_for(document_id: Uuid) -> String {
    format!("document:{document_id}")
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A named event with a JSON payload, as carried by a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: String,
}

impl BroadcastMessage {
    /// Serialize `payload` to JSON under `event`.
    pub fn new<P: Serialize>(event: impl Into<String>, payload: &P) -> Result<Self, ProtocolError> {
        let event = event.into();
        let payload = serde_json::to_string(payload)
            .map_err(|e| ProtocolError::InvalidPayload { event: event.clone(), reason: e.to_string() })?;
        Ok(Self { event, payload })
    }

    /// Parse the JSON payload into a typed event.
    pub fn decode_payload<P: DeserializeOwned>(&self) -> Result<P, ProtocolError> {
        serde_json::from_str(&self.payload).map_err(|e| ProtocolError::InvalidPayload {
            event: self.event.clone(),
            reason: e.to_string(),
        })
    }

    pub fn is(&self, event: &str) -> bool {
        self.event == event
    }
}

/// A local edit at full-snapshot granularity. Either field may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl DocumentChange {
    /// Whole title and whole content.
    pub fn full(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            content: Some(content.into()),
        }
    }
}

/// `document_change` payload: the change plus its author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChangeEvent {
    pub user_id: Uuid,
    #[serde(flatten)]
    pub change: DocumentChange,
}

/// Relay wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Client joins a topic. A connection holds at most one topic.
    Subscribe { topic: String },
    /// Relay confirms the subscription is established.
    Subscribed { topic: String },
    /// Relay refused the subscription.
    Rejected { reason: String },
    /// Client announces (or replaces) its presence entry.
    Track { entry: PresenceEntry },
    /// Client withdraws its presence entry.
    Untrack,
    /// Event fan-out, in both directions.
    Broadcast { message: BroadcastMessage },
    /// Full presence set after any change.
    PresenceSync { state: PresenceState },
    /// Client leaves its topic.
    Unsubscribe,
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("invalid {event} payload: {reason}")]
    InvalidPayload { event: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::RemoteCursor;
    use crate::identity::{CursorColor, Identity};

    #[test]
    fn test_topic_is_document_scoped() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(topic_for(a), format!("document:{a}"));
        assert_ne!(topic_for(a), topic_for(b));
    }

    #[test]
    fn test_document_change_payload_shape() {
        let event = DocumentChangeEvent {
            user_id: Uuid::nil(),
            change: DocumentChange {
                title: None,
                content: Some("<p>Hi</p>".into()),
            },
        };
        let message = BroadcastMessage::new(DOCUMENT_CHANGE, &event).unwrap();
        let json: serde_json::Value = serde_json::from_str(&message.payload).unwrap();

        assert_eq!(json["userId"], Uuid::nil().to_string());
        assert_eq!(json["content"], "<p>Hi</p>");
        assert!(json.get("title").is_none());

        let back: DocumentChangeEvent = message.decode_payload().unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_cursor_payload_from_browser_json() {
        let message = BroadcastMessage {
            event: CURSOR_MOVE.into(),
            payload: format!(
                r#"{{"userId":"{}","userName":"Bob","color":"hsl(10, 70%, 60%)","pos":42}}"#,
                Uuid::nil()
            ),
        };
        let cursor: RemoteCursor = message.decode_payload().unwrap();
        assert_eq!(cursor.pos, 42);
        assert_eq!(cursor.user_name, "Bob");
        assert_eq!(cursor.color, CursorColor::from_hue(10.0));
    }

    #[test]
    fn test_cursor_payload_missing_pos_is_error() {
        let message = BroadcastMessage {
            event: CURSOR_MOVE.into(),
            payload: format!(r#"{{"userId":"{}","userName":"Bob","color":"hsl(10, 70%, 60%)"}}"#, Uuid::nil()),
        };
        let err = message.decode_payload::<RemoteCursor>().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref event, .. } if event == CURSOR_MOVE));
    }

    #[test]
    fn test_frame_with_presence_roundtrip() {
        let identity = Identity::new(Uuid::new_v4(), "Alice", "alice@example.com");
        let entry = PresenceEntry::new(identity.clone());
        let mut state = PresenceState::new();
        state.insert(identity.user_id, entry.clone());

        let encoded = Frame::PresenceSync { state: state.clone() }.encode().unwrap();
        match Frame::decode(&encoded).unwrap() {
            Frame::PresenceSync { state: decoded } => assert_eq!(decoded, state),
            other => panic!("unexpected frame {other:?}"),
        }

        let encoded = Frame::Track { entry: entry.clone() }.encode().unwrap();
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Track { entry });
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            Frame::decode(&garbage),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_unix_millis_monotone_enough() {
        let a = unix_millis();
        let b = unix_millis();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
