//! Cross-process publish/subscribe bus.
//!
//! Every gateway process publishes group events to the bus and listens on a
//! channel pattern, so a message sent through one process reaches
//! subscribers connected to any other.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;

use crate::error::BusError;

pub const GROUP_CHANNEL_PREFIX: &str = "chat:group:";
pub const TYPING_CHANNEL_PREFIX: &str = "chat:typing:";
pub const GROUP_PATTERN: &str = "chat:group:*";
pub const TYPING_PATTERN: &str = "chat:typing:*";

pub fn group_channel(group_id: &str) -> String {
    format!("{GROUP_CHANNEL_PREFIX}{group_id}")
}

pub fn typing_channel(group_id: &str) -> String {
    format!("{TYPING_CHANNEL_PREFIX}{group_id}")
}

/// Glob match limited to a trailing `*`, which is all the gateway uses.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Messages from a pattern subscription. The stream yields an error or ends
/// when the underlying subscription is lost.
pub type BusStream = BoxStream<'static, Result<BusMessage, BusError>>;

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn psubscribe(&self, pattern: &str) -> Result<BusStream, BusError>;
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

const MEMORY_BUS_CAPACITY: usize = 1024;

/// Bus for a single process, or for several gateway instances sharing one
/// `Arc<MemoryBus>` in tests.
pub struct MemoryBus {
    sender: Mutex<broadcast::Sender<Arc<BusMessage>>>,
    failing_subscribes: Mutex<u32>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        Self {
            sender: Mutex::new(sender),
            failing_subscribes: Mutex::new(0),
        }
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every live subscription, as if the bus connection were lost.
    pub fn sever(&self) {
        let (fresh, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        *self.sender.lock() = fresh;
    }

    /// Make the next `n` subscribe attempts fail.
    pub fn fail_next_subscribes(&self, n: u32) {
        *self.failing_subscribes.lock() = n;
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.lock().receiver_count()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let message = Arc::new(BusMessage {
            channel: channel.to_string(),
            payload,
        });
        // No receivers is not an error: nobody is listening yet.
        let _ = self.sender.lock().send(message);
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<BusStream, BusError> {
        {
            let mut failing = self.failing_subscribes.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(BusError::Disconnected);
            }
        }

        let rx = self.sender.lock().subscribe();
        let pattern = pattern.to_string();
        let stream = stream::unfold(Some(rx), move |state| {
            let pattern = pattern.clone();
            async move {
                let mut rx = state?;
                loop {
                    match rx.recv().await {
                        Ok(message) if pattern_matches(&pattern, &message.channel) => {
                            return Some((Ok((*message).clone()), Some(rx)));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, %pattern, "bus subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Some((Err(BusError::Disconnected), None));
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ---------------------------------------------------------------------------
// Redis pub/sub
// ---------------------------------------------------------------------------

pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<BusStream, BusError> {
        // Pub/sub needs a dedicated connection; the manager is multiplexed.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        let stream = pubsub.into_on_message().map(|msg| {
            Ok(BusMessage {
                channel: msg.get_channel_name().to_string(),
                payload: msg.get_payload_bytes().to_vec(),
            })
        });
        Ok(stream.boxed())
    }
}
