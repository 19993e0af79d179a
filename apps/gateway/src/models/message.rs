use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Delivery state of a persisted message. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

/// A message as persisted by the message store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StoredMessage {
    /// Server-assigned, time-ordered id.
    pub id: i64,
    pub group_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

/// A message handed to the store for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub group_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// "Before this point" marker for backward pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    BeforeId(i64),
    BeforeTs(DateTime<Utc>),
}

impl Cursor {
    /// Whether `message` lies strictly before the cursor.
    pub fn admits(&self, message: &StoredMessage) -> bool {
        match self {
            Cursor::BeforeId(id) => message.id < *id,
            Cursor::BeforeTs(ts) => message.created_at < *ts,
        }
    }
}
