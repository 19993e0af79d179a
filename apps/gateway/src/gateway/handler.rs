//! Dispatch for frames received on an authenticated connection.

use std::sync::Arc;

use crate::AppState;

use super::connection::{Connection, CLOSE_INVALID_FRAME};
use super::events::{
    ChatEvent, ClientFrame, EventType, ServerFrame, ERR_MISSING_FIELDS, ERR_NOT_DELIVERED,
    ERR_TOO_LONG, ERR_UNKNOWN_TYPE,
};

/// Longest accepted message text, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// What the session loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Handle one text frame.
pub async fn handle_frame(state: &AppState, conn: &Arc<Connection>, text: &str) -> Flow {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(user_id = %conn.user_id(), error = %err, "invalid frame");
            conn.close(CLOSE_INVALID_FRAME, "Invalid JSON");
            return Flow::Close;
        }
    };

    match frame.kind.as_str() {
        "subscribe" => handle_subscribe(conn, &frame),
        "unsubscribe" => handle_unsubscribe(conn, &frame),
        "message" => handle_message(state, conn, &frame).await,
        "typing_start" => handle_typing(state, conn, &frame, EventType::TypingStart).await,
        "typing_stop" => handle_typing(state, conn, &frame, EventType::TypingStop).await,
        "ping" => reply(conn, &ServerFrame::Pong),
        other => {
            tracing::debug!(user_id = %conn.user_id(), kind = other, "unknown frame type");
            reply(conn, &ServerFrame::error(ERR_UNKNOWN_TYPE));
        }
    }
    Flow::Continue
}

fn reply(conn: &Connection, frame: &ServerFrame) {
    if let Err(err) = conn.send_frame(frame) {
        tracing::debug!(user_id = %conn.user_id(), error = %err, "failed to queue reply");
    }
}

// Subscriptions go through this session's own handle rather than a lookup by
// identity, so a replaced session cannot touch its successor's groups.
fn handle_subscribe(conn: &Connection, frame: &ClientFrame) {
    for group_id in frame.target_groups() {
        conn.subscribe(&group_id);
        tracing::debug!(user_id = %conn.user_id(), %group_id, "subscribed");
    }
}

fn handle_unsubscribe(conn: &Connection, frame: &ClientFrame) {
    for group_id in frame.target_groups() {
        conn.unsubscribe(&group_id);
        tracing::debug!(user_id = %conn.user_id(), %group_id, "unsubscribed");
    }
}

/// Resolve the sender's display name, or `None` if they may not post.
/// Checker failures count as a denial.
async fn authorize(state: &AppState, conn: &Connection, group_id: &str) -> Option<String> {
    match state.membership.can_post(conn.identity(), group_id).await {
        Ok(Some(name)) => Some(name),
        Ok(None) => {
            tracing::debug!(user_id = %conn.user_id(), group_id, "sender is not a member");
            None
        }
        Err(err) => {
            tracing::warn!(user_id = %conn.user_id(), group_id, error = %err, "membership check failed");
            None
        }
    }
}

async fn handle_message(state: &AppState, conn: &Connection, frame: &ClientFrame) {
    let group_id = frame.group();
    let text = frame.text.as_deref().unwrap_or("").trim();
    if group_id.is_empty() || text.is_empty() {
        reply(conn, &ServerFrame::error(ERR_MISSING_FIELDS));
        return;
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        reply(conn, &ServerFrame::error(ERR_TOO_LONG));
        return;
    }

    // Non-members are dropped silently.
    let Some(sender_name) = authorize(state, conn, group_id).await else {
        return;
    };

    let event = ChatEvent::message(group_id, conn.user_id(), &sender_name, text);
    let published = match state.publisher.publish(event).await {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(user_id = %conn.user_id(), group_id, error = %err, "publish failed");
            reply(conn, &ServerFrame::error(ERR_NOT_DELIVERED));
            return;
        }
    };

    if let Err(err) = state.store_writer.enqueue(published.to_new_message()).await {
        tracing::error!(group_id, error = %err, "message published but not persisted");
    }
}

async fn handle_typing(state: &AppState, conn: &Connection, frame: &ClientFrame, kind: EventType) {
    let group_id = frame.group();
    if group_id.is_empty() {
        return;
    }
    let Some(sender_name) = authorize(state, conn, group_id).await else {
        return;
    };
    let event = ChatEvent::typing(kind, group_id, conn.user_id(), &sender_name);
    if let Err(err) = state.publisher.publish(event).await {
        tracing::debug!(user_id = %conn.user_id(), group_id, error = %err, "typing publish failed");
    }
}
