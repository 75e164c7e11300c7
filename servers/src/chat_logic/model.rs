use bytes::Bytes;
use chrono::{DateTime, Utc};
use lib_common::core::{Inbound, RoomRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// History entries sent for a `get_history` without a `limit`.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

const KNOWN_TYPES: [&str; 4] = ["chat_message", "heartbeat", "get_users", "get_history"];

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

/// Structured frames a client may send. Text that is not a JSON object is a
/// plain chat message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ChatMessage {
        #[serde(default)]
        message: String,
    },
    Heartbeat,
    GetUsers,
    GetHistory {
        #[serde(default = "default_history_limit")]
        limit: usize,
    },
}

/// Control frames the server sends outside the room's message stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HeartbeatResponse { timestamp: DateTime<Utc> },
    Error { message: String, timestamp: DateTime<Utc> },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// What an inbound text frame means.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Handed to the room.
    Room(Inbound),
    /// Answered with an `error` frame; the reason is sent to the client.
    Rejected(String),
    Ignored,
}

pub fn decode_text(text: &str) -> Decoded {
    if text.trim().is_empty() {
        return Decoded::Ignored;
    }
    let value = match serde_json::from_str::<Value>(text) {
        Ok(value) if value.is_object() => value,
        _ => return Decoded::Room(Inbound::Payload(Bytes::copy_from_slice(text.as_bytes()))),
    };

    // An object without a type counts as an unknown "message" type.
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("message");
    if !KNOWN_TYPES.contains(&kind) {
        return Decoded::Rejected(format!("unknown message type: {}", kind));
    }

    match ClientMessage::deserialize(&value) {
        Ok(ClientMessage::ChatMessage { message }) if message.trim().is_empty() => Decoded::Ignored,
        Ok(ClientMessage::ChatMessage { message }) => Decoded::Room(Inbound::Payload(Bytes::from(message))),
        Ok(ClientMessage::Heartbeat) => Decoded::Room(Inbound::Heartbeat),
        Ok(ClientMessage::GetUsers) => Decoded::Room(Inbound::Request(RoomRequest::Members)),
        Ok(ClientMessage::GetHistory { limit }) => {
            Decoded::Room(Inbound::Request(RoomRequest::History { limit }))
        }
        Err(e) => Decoded::Rejected(format!("malformed {} frame: {}", kind, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> Decoded {
        Decoded::Room(Inbound::Payload(Bytes::copy_from_slice(text.as_bytes())))
    }

    #[test]
    fn structured_chat_is_unwrapped() {
        assert_eq!(decode_text(r#"{"type":"chat_message","message":"hi all"}"#), payload("hi all"));
    }

    #[test]
    fn plain_text_and_non_object_json_are_chat() {
        assert_eq!(decode_text("hello"), payload("hello"));
        assert_eq!(decode_text("42"), payload("42"));
        assert_eq!(decode_text(r#""quoted""#), payload(r#""quoted""#));
    }

    #[test]
    fn unknown_or_missing_types_are_rejected() {
        assert_eq!(
            decode_text(r#"{"type":"typing"}"#),
            Decoded::Rejected("unknown message type: typing".to_string())
        );
        assert_eq!(
            decode_text(r#"{"message":"no type"}"#),
            Decoded::Rejected("unknown message type: message".to_string())
        );
        assert!(matches!(
            decode_text(r#"{"type":"get_history","limit":"lots"}"#),
            Decoded::Rejected(reason) if reason.starts_with("malformed get_history")
        ));
    }

    #[test]
    fn requests_are_decoded() {
        assert_eq!(
            decode_text(r#"{"type":"get_users"}"#),
            Decoded::Room(Inbound::Request(RoomRequest::Members))
        );
        assert_eq!(
            decode_text(r#"{"type":"get_history","limit":5}"#),
            Decoded::Room(Inbound::Request(RoomRequest::History { limit: 5 }))
        );
        assert_eq!(
            decode_text(r#"{"type":"get_history"}"#),
            Decoded::Room(Inbound::Request(RoomRequest::History { limit: DEFAULT_HISTORY_LIMIT }))
        );
    }

    #[test]
    fn heartbeat_and_blank_frames_are_not_chat() {
        assert_eq!(decode_text(r#"{"type":"heartbeat"}"#), Decoded::Room(Inbound::Heartbeat));
        assert_eq!(decode_text("   "), Decoded::Ignored);
        assert_eq!(decode_text(r#"{"type":"chat_message","message":" "}"#), Decoded::Ignored);
        assert_eq!(decode_text(r#"{"type":"chat_message"}"#), Decoded::Ignored);
    }

    #[test]
    fn server_messages_are_tagged() {
        let json = serde_json::to_value(ServerMessage::HeartbeatResponse { timestamp: Utc::now() }).unwrap();
        assert_eq!(json["type"], "heartbeat_response");
        let json = serde_json::to_value(ServerMessage::error("nope")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "nope");
    }
}
