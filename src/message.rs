//! Message envelope definitions
//!
//! The envelope is the only unit that travels from a room to its members.
//! Serialized as `{"type", "sender", "content", "time"}` with `time` in
//! epoch milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Sender name used for notices synthesized by a room
pub const SYSTEM_SENDER: &str = "system";

/// Envelope kind, serialized as the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Text sent by a member
    Message,
    /// Notice produced by the room itself
    System,
}

/// Room → member message
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub sender: String,
    pub content: String,
    /// Creation time, epoch milliseconds
    pub time: i64,
}

impl Envelope {
    /// Wrap text received from a member
    ///
    /// Content longer than `max_bytes` is truncated on a char boundary.
    pub fn message(sender: impl Into<String>, content: impl Into<String>, max_bytes: usize) -> Self {
        let mut content = content.into();
        truncate_utf8(&mut content, max_bytes);
        Self {
            kind: EnvelopeKind::Message,
            sender: sender.into(),
            content,
            time: now_millis(),
        }
    }

    /// Build a room notice
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::System,
            sender: SYSTEM_SENDER.to_string(),
            content: content.into(),
            time: now_millis(),
        }
    }

    /// Serialize to the wire form
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Reply sent on the `/create-room` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCreated {
    pub room_id: String,
    pub lifetime_minutes: u64,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

fn truncate_utf8(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}
