//! # Wire Frames
//!
//! The engine hands transports ready-made bytes: a JSON object tagged by
//! `type`. Frames are encoded once per broadcast and the same `Bytes` is
//! cloned (reference counted) for every peer.
//!
//! UTF-8 payloads travel as plain strings; anything else is base64 encoded
//! and flagged through `encoding`, so binary content survives the trip.

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::message::{Message, MessageKind};
use crate::core::registry::MemberInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Message {
        seq: u64,
        sender: String,
        kind: MessageKind,
        payload: String,
        encoding: PayloadEncoding,
        timestamp: DateTime<Utc>,
    },
    /// Current membership. Not sequenced and not kept in history.
    UserList {
        users: Vec<MemberInfo>,
        timestamp: DateTime<Utc>,
    },
    /// Recent history sent to one member on request, oldest first.
    MessageHistory {
        messages: Vec<Frame>,
        timestamp: DateTime<Utc>,
    },
    /// Sent to every remaining member right before the room closes it.
    Shutdown { timestamp: DateTime<Utc> },
}

impl Frame {
    pub fn from_message(message: &Message) -> Self {
        let (payload, encoding) = match std::str::from_utf8(&message.payload) {
            Ok(text) => (text.to_string(), PayloadEncoding::Utf8),
            Err(_) => (
                general_purpose::STANDARD.encode(&message.payload),
                PayloadEncoding::Base64,
            ),
        };
        Frame::Message {
            seq: message.seq,
            sender: message.sender.clone(),
            kind: message.kind,
            payload,
            encoding,
            timestamp: message.timestamp,
        }
    }

    pub fn user_list(users: Vec<MemberInfo>) -> Self {
        Frame::UserList {
            users,
            timestamp: Utc::now(),
        }
    }

    pub fn message_history<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Self {
        Frame::MessageHistory {
            messages: messages.into_iter().map(Frame::from_message).collect(),
            timestamp: Utc::now(),
        }
    }

    pub fn shutdown() -> Self {
        Frame::Shutdown { timestamp: Utc::now() }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Original payload bytes of a message frame, `None` for other frames or
    /// a corrupt base64 body.
    pub fn payload_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Frame::Message { payload, encoding: PayloadEncoding::Utf8, .. } => {
                Some(payload.as_bytes().to_vec())
            }
            Frame::Message { payload, encoding: PayloadEncoding::Base64, .. } => {
                general_purpose::STANDARD.decode(payload).ok()
            }
            _ => None,
        }
    }

    pub fn seq(&self) -> Option<u64> {
        match self {
            Frame::Message { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}
