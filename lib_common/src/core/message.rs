use std::borrow::Cow;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sender name used for presence notices.
pub const SYSTEM_SENDER: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Chat,
    Join,
    Leave,
}

/// # Message
///
/// One unit of room traffic. The payload is opaque to the engine.
///
/// `seq` is zero until the `Dispatcher` accepts the message; acceptance
/// assigns a strictly increasing number, which is the engine's total order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub seq: u64,
    pub sender: String,
    pub kind: MessageKind,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// A chat message from `sender`, stamped now.
    pub fn new(sender: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            seq: 0,
            sender: sender.into(),
            kind: MessageKind::Chat,
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    /// A presence notice about `identity`.
    pub fn presence(kind: MessageKind, identity: &str) -> Self {
        let text = match kind {
            MessageKind::Join => format!("{} joined the room", identity),
            MessageKind::Leave => format!("{} left the room", identity),
            MessageKind::Chat => identity.to_string(),
        };
        Self {
            kind,
            ..Self::new(SYSTEM_SENDER, text)
        }
    }

    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
