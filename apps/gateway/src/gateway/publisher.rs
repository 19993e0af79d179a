use std::sync::Arc;

use chrono::Utc;

use super::bus::Bus;
use super::events::ChatEvent;
use crate::error::BusError;

/// Serializes chat events and publishes them on their group's bus channel.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn Bus>,
}

impl Publisher {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Publish `event`, stamping it with the current time if it has none.
    /// Returns the event exactly as it went out.
    pub async fn publish(&self, mut event: ChatEvent) -> Result<ChatEvent, BusError> {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }
        let channel = event.channel();
        let payload = serde_json::to_vec(&event)?;
        self.bus.publish(&channel, payload).await?;
        tracing::debug!(%channel, kind = ?event.kind, sender_id = %event.sender_id, "published event");
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::bus::{MemoryBus, GROUP_PATTERN};
    use crate::gateway::events::EventType;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn publish_stamps_and_routes() {
        let bus = Arc::new(MemoryBus::new());
        let mut stream = bus.psubscribe(GROUP_PATTERN).await.unwrap();
        let publisher = Publisher::new(bus.clone());

        let sent = publisher
            .publish(ChatEvent::message("g1", "u1", "Alice", "hello"))
            .await
            .unwrap();
        assert!(sent.timestamp.is_some());

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.channel, "chat:group:g1");
        let decoded: ChatEvent = serde_json::from_slice(&received.payload).unwrap();
        assert_eq!(decoded, sent);
    }

    #[tokio::test]
    async fn existing_timestamp_is_kept() {
        let publisher = Publisher::new(Arc::new(MemoryBus::new()));
        let mut event = ChatEvent::typing(EventType::TypingStop, "g1", "u1", "Alice");
        let at = "2026-05-01T00:00:00Z".parse().unwrap();
        event.timestamp = Some(at);
        let sent = publisher.publish(event).await.unwrap();
        assert_eq!(sent.timestamp, Some(at));
    }
}
