//! Background persistence pool.
//!
//! Session loops hand accepted messages to bounded queues drained by a fixed
//! number of workers. Each group hashes to exactly one worker, so a group's
//! messages are appended in the order they were accepted. Bus delivery never
//! waits on the store; when a worker falls behind, its queue fills and only
//! sessions posting to its groups wait for room.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::MessageStore;
use crate::cache::RecentCache;
use crate::models::message::NewMessage;

/// Returned when the pool has shut down.
#[derive(Debug, thiserror::Error)]
#[error("persistence queue closed")]
pub struct QueueClosed;

/// Cloneable handle for submitting messages to the persistence pool.
#[derive(Clone)]
pub struct StoreWriter {
    shards: Arc<[mpsc::Sender<NewMessage>]>,
}

impl StoreWriter {
    /// Start `workers` tasks sharing `capacity` queued messages between them.
    ///
    /// When `warm_cache` is given, each persisted message is also pushed into
    /// that group's recent-cache entry if one is currently cached.
    pub fn spawn(
        store: Arc<dyn MessageStore>,
        warm_cache: Option<Arc<dyn RecentCache>>,
        workers: usize,
        capacity: usize,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let workers = workers.max(1);
        let per_shard = capacity.div_ceil(workers).max(1);

        let (shards, handles): (Vec<_>, Vec<_>) = (0..workers)
            .map(|worker| {
                let (tx, mut rx) = mpsc::channel(per_shard);
                let store = store.clone();
                let cache = warm_cache.clone();
                let handle = tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        persist(worker, store.as_ref(), cache.as_deref(), message).await;
                    }
                    tracing::debug!(worker, "persistence worker stopped");
                });
                (tx, handle)
            })
            .unzip();

        (
            Self {
                shards: shards.into(),
            },
            handles,
        )
    }

    /// Queue a message for persistence, waiting for room if its worker's
    /// queue is full.
    pub async fn enqueue(&self, message: NewMessage) -> Result<(), QueueClosed> {
        let shard = &self.shards[shard_for(&message.group_id, self.shards.len())];
        shard.send(message).await.map_err(|_| QueueClosed)
    }
}

fn shard_for(group_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    group_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

async fn persist(
    worker: usize,
    store: &dyn MessageStore,
    cache: Option<&dyn RecentCache>,
    message: NewMessage,
) {
    let group_id = message.group_id.clone();
    match store.append(message).await {
        Ok(stored) => {
            tracing::debug!(worker, group_id = %group_id, message_id = stored.id, "message persisted");
            if let Some(cache) = cache {
                if let Err(err) = cache.push_if_cached(&group_id, &stored).await {
                    tracing::warn!(?err, group_id = %group_id, "recent cache refresh failed");
                }
            }
        }
        Err(err) => {
            tracing::warn!(?err, worker, group_id = %group_id, "failed to persist message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryRecentCache;
    use crate::store::MemoryMessageStore;
    use chrono::Utc;
    use std::time::Duration;

    fn msg(text: &str) -> NewMessage {
        NewMessage {
            group_id: "g1".into(),
            sender_id: "u1".into(),
            sender_name: "Alice".into(),
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    async fn wait_for_len(store: &MemoryMessageStore, n: usize) {
        for _ in 0..100 {
            if store.len("g1") == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("store never reached {n} messages (has {})", store.len("g1"));
    }

    #[tokio::test]
    async fn enqueued_messages_are_persisted() {
        let store = Arc::new(MemoryMessageStore::new(0));
        let (writer, _handles) = StoreWriter::spawn(store.clone(), None, 2, 8);

        for i in 0..5 {
            writer.enqueue(msg(&format!("m{i}"))).await.unwrap();
        }
        wait_for_len(&store, 5).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_group_is_persisted_in_enqueue_order() {
        let store = Arc::new(MemoryMessageStore::new(0));
        let (writer, _handles) = StoreWriter::spawn(store.clone(), None, 4, 64);

        for i in 0..500 {
            writer.enqueue(msg(&format!("m{i}"))).await.unwrap();
        }
        wait_for_len(&store, 500).await;

        let page = store.query("g1", None, 500).await.unwrap();
        let texts: Vec<String> = page.messages.into_iter().map(|m| m.text).collect();
        let expected: Vec<String> = (0..500).map(|i| format!("m{i}")).collect();
        assert_eq!(texts, expected);
    }

    #[test]
    fn groups_map_to_a_stable_shard() {
        for group in ["g1", "g2", "a-much-longer-group-id"] {
            let shard = shard_for(group, 4);
            assert!(shard < 4);
            assert_eq!(shard, shard_for(group, 4));
        }
        assert_eq!(shard_for("g1", 1), 0);
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_workers_keep_running() {
        let store = Arc::new(MemoryMessageStore::new(0));
        let (writer, handles) = StoreWriter::spawn(store.clone(), None, 1, 8);

        store.set_unavailable(true);
        writer.enqueue(msg("lost")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handles[0].is_finished());

        store.set_unavailable(false);
        writer.enqueue(msg("kept")).await.unwrap();
        wait_for_len(&store, 1).await;
    }

    #[tokio::test]
    async fn workers_stop_when_all_handles_drop() {
        let store = Arc::new(MemoryMessageStore::new(0));
        let (writer, handles) = StoreWriter::spawn(store, None, 2, 8);
        drop(writer);
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("worker did not stop")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn warm_cache_only_touches_cached_groups() {
        let store = Arc::new(MemoryMessageStore::new(0));
        let cache = Arc::new(MemoryRecentCache::new());
        let (writer, _handles) =
            StoreWriter::spawn(store.clone(), Some(cache.clone() as Arc<dyn RecentCache>), 1, 8);

        // Not cached yet: persistence must not create an entry.
        writer.enqueue(msg("first")).await.unwrap();
        wait_for_len(&store, 1).await;
        assert!(cache.get("g1").await.unwrap().is_none());

        let page = store.query("g1", None, 50).await.unwrap();
        cache.warm("g1", &page.messages).await.unwrap();

        writer.enqueue(msg("second")).await.unwrap();
        wait_for_len(&store, 2).await;
        for _ in 0..100 {
            if cache.get("g1").await.unwrap().map_or(0, |c| c.len()) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let cached = cache.get("g1").await.unwrap().unwrap();
        assert_eq!(cached[0].text, "second");
        assert_eq!(cached[1].text, "first");
    }
}
