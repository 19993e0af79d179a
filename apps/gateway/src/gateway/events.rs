//! Wire-format events and frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bus;
use crate::models::message::NewMessage;

// ---------------------------------------------------------------------------
// Bus / delivery event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    TypingStart,
    TypingStop,
    ReadReceipt,
    Presence,
    Error,
    ServerNotice,
}

impl EventType {
    pub fn is_typing(self) -> bool {
        matches!(self, EventType::TypingStart | EventType::TypingStop)
    }
}

/// An event published on the bus and delivered verbatim to subscribed
/// connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub group_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub text: String,
    /// Stamped by the publisher when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatEvent {
    pub fn message(group_id: &str, sender_id: &str, sender_name: &str, text: &str) -> Self {
        Self {
            kind: EventType::Message,
            group_id: group_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            timestamp: None,
        }
    }

    pub fn typing(kind: EventType, group_id: &str, sender_id: &str, sender_name: &str) -> Self {
        Self {
            kind,
            group_id: group_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            text: String::new(),
            timestamp: None,
        }
    }

    /// Bus channel this event is published on. Typing indicators use their
    /// own namespace.
    pub fn channel(&self) -> String {
        if self.kind.is_typing() {
            bus::typing_channel(&self.group_id)
        } else {
            bus::group_channel(&self.group_id)
        }
    }

    /// The persistence record for a published `message` event.
    pub fn to_new_message(&self) -> NewMessage {
        NewMessage {
            group_id: self.group_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            text: self.text.clone(),
            created_at: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server frame
// ---------------------------------------------------------------------------

/// A frame received from the client.
///
/// Parsed leniently: only `type` decides the handler, so an unknown type can
/// be answered with an error frame instead of failing the parse.
#[derive(Debug, Default, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub groups: Option<Vec<String>>,
    #[serde(default)]
    pub text: Option<String>,
}

impl ClientFrame {
    /// `group_id` plus `groups`, trimmed, with blanks and duplicates removed.
    pub fn target_groups(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let candidates = self.group_id.iter().chain(self.groups.iter().flatten());
        for group in candidates {
            let group = group.trim();
            if !group.is_empty() && !out.iter().any(|g| g == group) {
                out.push(group.to_string());
            }
        }
        out
    }

    pub fn group(&self) -> &str {
        self.group_id.as_deref().map(str::trim).unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Server → Client control frames
// ---------------------------------------------------------------------------

/// Frames the gateway writes directly to one client. Group traffic is sent as
/// serialized [`ChatEvent`]s instead.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Pong,
    Error { error: String },
    ServerNotice { text: String },
}

impl ServerFrame {
    pub fn error(message: &str) -> Self {
        ServerFrame::Error {
            error: message.to_string(),
        }
    }
}

pub const ERR_UNKNOWN_TYPE: &str = "unknown message type";
pub const ERR_MISSING_FIELDS: &str = "group_id and text are required";
pub const ERR_TOO_LONG: &str = "message too long";
pub const ERR_NOT_DELIVERED: &str = "message could not be delivered";
