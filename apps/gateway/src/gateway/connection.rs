//! A live client connection as seen by the registry.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::auth::Identity;

/// Close codes (4000-range for application-level).
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_INVALID_FRAME: u16 = 4000;
pub const CLOSE_REPLACED: u16 = 4005;
pub const CLOSE_SLOW_CONSUMER: u16 = 4008;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
    #[error("frame encoding failed")]
    Encode,
}

/// One-shot close latch shared by the session loop, the writer task and
/// anyone holding the connection.
pub struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(false),
        }
    }
}

impl CloseSignal {
    /// Trip the latch. Returns `true` for the first caller only.
    pub fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the latch has been tripped.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

pub struct Connection {
    id: String,
    identity: Identity,
    tx: mpsc::Sender<Message>,
    subscriptions: Mutex<HashSet<String>>,
    signal: Arc<CloseSignal>,
}

impl Connection {
    pub fn new(identity: Identity, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: chat_common::prefixed_ulid(chat_common::id::prefix::CONNECTION),
            identity,
            tx,
            subscriptions: Mutex::new(HashSet::new()),
            signal: Arc::new(CloseSignal::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    /// Queue a frame without waiting. A full queue means the client is not
    /// keeping up.
    pub fn send(&self, message: Message) -> Result<(), DeliveryError> {
        if self.signal.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn send_frame<T: Serialize>(&self, frame: &T) -> Result<(), DeliveryError> {
        let json = serde_json::to_string(frame).map_err(|_| DeliveryError::Encode)?;
        self.send(Message::Text(json.into()))
    }

    /// Returns `true` if the group was newly added.
    pub fn subscribe(&self, group_id: &str) -> bool {
        self.subscriptions.lock().insert(group_id.to_string())
    }

    pub fn unsubscribe(&self, group_id: &str) -> bool {
        self.subscriptions.lock().remove(group_id)
    }

    pub fn is_subscribed(&self, group_id: &str) -> bool {
        self.subscriptions.lock().contains(group_id)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.subscriptions.lock().iter().cloned().collect();
        groups.sort();
        groups
    }

    /// Close the connection: trips the latch so the session loop exits and
    /// queues a close frame for the writer. Later calls are no-ops.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if !self.signal.close() {
            return false;
        }
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        }));
        // Best effort; the writer is aborted after a grace period anyway.
        let _ = self.tx.try_send(frame);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    pub async fn closed(&self) {
        self.signal.wait().await
    }

    pub fn close_signal(&self) -> Arc<CloseSignal> {
        self.signal.clone()
    }
}
