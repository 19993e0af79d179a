//! Process-local registry of live connections, one per identity.

use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::connection::{Connection, DeliveryError, CLOSE_NORMAL, CLOSE_REPLACED, CLOSE_SLOW_CONSUMER};
use super::events::{ChatEvent, ServerFrame};
use crate::auth::Identity;

/// Outcome of delivering one event to the local connections.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for `identity`. Any existing connection for
    /// the same identity is removed and told to close.
    pub fn register(&self, identity: Identity, tx: mpsc::Sender<Message>) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(identity, tx));
        let previous = self
            .connections
            .insert(conn.user_id().to_string(), conn.clone());

        if let Some(old) = previous {
            tracing::info!(
                user_id = %conn.user_id(),
                old_connection = %old.id(),
                new_connection = %conn.id(),
                "replacing existing connection"
            );
            let _ = old.send_frame(&ServerFrame::ServerNotice {
                text: "session replaced by a newer connection".into(),
            });
            old.close(CLOSE_REPLACED, "session replaced");
        }
        conn
    }

    /// Remove whatever connection is registered for `user_id` and close it.
    /// Unknown identities are a no-op.
    pub fn unregister(&self, user_id: &str) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(user_id)?;
        conn.close(CLOSE_NORMAL, "unregistered");
        Some(conn)
    }

    /// Remove `conn` only if it is still the registered connection for its
    /// identity, so a session ending late cannot drop its replacement.
    pub fn release(&self, conn: &Connection) -> bool {
        self.connections
            .remove_if(conn.user_id(), |_, current| current.id() == conn.id())
            .is_some()
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(user_id).map(|c| c.clone())
    }

    /// Add `group_id` to the identity's subscription set. Returns `false` if
    /// the identity has no live connection.
    pub fn subscribe(&self, user_id: &str, group_id: &str) -> bool {
        match self.connections.get(user_id) {
            Some(conn) => {
                conn.subscribe(group_id);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, user_id: &str, group_id: &str) -> bool {
        match self.connections.get(user_id) {
            Some(conn) => {
                conn.unsubscribe(group_id);
                true
            }
            None => false,
        }
    }

    /// Snapshot of connections subscribed to `group_id`. Taken before any
    /// send so no registry lock is held while delivering.
    pub fn connections_interested_in(&self, group_id: &str) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_subscribed(group_id))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Deliver `event` to every local subscriber of its group. A failing
    /// connection is dropped from the registry without affecting the rest.
    pub fn fan_out(&self, event: &ChatEvent) -> FanOutReport {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(err) => {
                tracing::error!(?err, group_id = %event.group_id, "failed to encode event");
                return FanOutReport::default();
            }
        };

        let mut report = FanOutReport::default();
        for conn in self.connections_interested_in(&event.group_id) {
            match conn.send(Message::Text(payload.clone().into())) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        user_id = %conn.user_id(),
                        connection = %conn.id(),
                        group_id = %event.group_id,
                        error = %err,
                        "delivery failed, dropping connection"
                    );
                    if err == DeliveryError::Full {
                        conn.close(CLOSE_SLOW_CONSUMER, "client too slow");
                    }
                    self.release(&conn);
                }
            }
        }
        report
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(
        registry: &ConnectionRegistry,
        user: &str,
        buffer: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer);
        (registry.register(Identity::new(user), tx), rx)
    }

    fn text_of(message: Message) -> String {
        match message {
            Message::Text(text) => text.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn register_replaces_and_closes_previous() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = register(&registry, "u1", 8);
        let (second, _rx) = register(&registry, "u1", 8);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("u1").unwrap().id(), second.id());
        assert!(first.is_closed());
        assert!(!second.is_closed());

        assert!(text_of(first_rx.try_recv().unwrap()).contains("server_notice"));
        match first_rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_REPLACED),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn stale_release_keeps_replacement() {
        let registry = ConnectionRegistry::new();
        let (first, _a) = register(&registry, "u1", 8);
        let (second, _b) = register(&registry, "u1", 8);

        assert!(!registry.release(&first));
        assert_eq!(registry.get("u1").unwrap().id(), second.id());
        assert!(registry.release(&second));
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = register(&registry, "u1", 8);
        assert!(registry.unregister("u1").is_some());
        assert!(conn.is_closed());
        assert!(registry.unregister("u1").is_none());
        assert!(registry.unregister("nobody").is_none());
    }

    #[test]
    fn subscribe_requires_live_connection() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.subscribe("u1", "g1"));
        let (_conn, _rx) = register(&registry, "u1", 8);
        assert!(registry.subscribe("u1", "g1"));
        assert_eq!(registry.connections_interested_in("g1").len(), 1);
        assert!(registry.unsubscribe("u1", "g1"));
        assert!(registry.connections_interested_in("g1").is_empty());
    }

    #[test]
    fn fan_out_reaches_only_subscribers() {
        let registry = ConnectionRegistry::new();
        let (_a, mut a_rx) = register(&registry, "a", 8);
        let (_b, mut b_rx) = register(&registry, "b", 8);
        let (_c, mut c_rx) = register(&registry, "c", 8);
        registry.subscribe("a", "g1");
        registry.subscribe("b", "g1");
        registry.subscribe("c", "g2");

        let report = registry.fan_out(&ChatEvent::message("g1", "a", "A", "hi"));
        assert_eq!(report, FanOutReport { delivered: 2, failed: 0 });

        let value: serde_json::Value = serde_json::from_str(&text_of(a_rx.try_recv().unwrap())).unwrap();
        assert_eq!(value["text"], "hi");
        assert!(b_rx.try_recv().is_ok());
        assert!(c_rx.try_recv().is_err());
    }

    #[test]
    fn slow_consumer_is_dropped_without_affecting_others() {
        let registry = ConnectionRegistry::new();
        let (slow, _slow_rx) = register(&registry, "slow", 1);
        let (_fast, mut fast_rx) = register(&registry, "fast", 8);
        registry.subscribe("slow", "g1");
        registry.subscribe("fast", "g1");

        let first = registry.fan_out(&ChatEvent::message("g1", "x", "X", "one"));
        assert_eq!(first.delivered, 2);
        let second = registry.fan_out(&ChatEvent::message("g1", "x", "X", "two"));
        assert_eq!(second, FanOutReport { delivered: 1, failed: 1 });

        assert!(slow.is_closed());
        assert!(registry.get("slow").is_none());
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[test]
    fn closed_receiver_is_released() {
        let registry = ConnectionRegistry::new();
        let (_conn, rx) = register(&registry, "u1", 8);
        registry.subscribe("u1", "g1");
        drop(rx);

        let report = registry.fan_out(&ChatEvent::message("g1", "x", "X", "hi"));
        assert_eq!(report.failed, 1);
        assert!(registry.is_empty());
    }
}
