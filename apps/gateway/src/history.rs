//! History read path: recent cache for the first page, store for the rest.

use std::sync::Arc;

use crate::cache::{RecentCache, RECENT_CACHE_SIZE};
use crate::error::StoreError;
use crate::models::message::Cursor;
use crate::store::{MessageStore, Page};

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 100;

/// Clamp a client-supplied page size into `[1, MAX_LIMIT]`.
pub fn clamp_limit(limit: Option<i64>) -> usize {
    match limit {
        None => DEFAULT_LIMIT,
        Some(n) => n.clamp(1, MAX_LIMIT as i64) as usize,
    }
}

pub struct HistoryService {
    store: Arc<dyn MessageStore>,
    cache: Arc<dyn RecentCache>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn MessageStore>, cache: Arc<dyn RecentCache>) -> Self {
        Self { store, cache }
    }

    /// Load one page, oldest-first.
    pub async fn load(
        &self,
        group_id: &str,
        before: Option<Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let limit = limit.clamp(1, MAX_LIMIT);

        if before.is_some() || limit > RECENT_CACHE_SIZE {
            return self.store.query(group_id, before, limit).await;
        }

        match self.cache.get(group_id).await {
            Ok(Some(newest_first)) => {
                tracing::debug!(group_id, cached = newest_first.len(), "history cache hit");
                let has_more = newest_first.len() >= limit;
                let mut messages: Vec<_> = newest_first.into_iter().take(limit).collect();
                messages.reverse();
                return Ok(Page { messages, has_more });
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(?err, group_id, "recent cache read failed, using store");
            }
        }

        // Fetch a full cache window so later first-page requests of any
        // cacheable size can be served from the warmed entry.
        let window = self.store.query(group_id, None, RECENT_CACHE_SIZE).await?;
        if let Err(err) = self.cache.warm(group_id, &window.messages).await {
            tracing::warn!(?err, group_id, "failed to warm recent cache");
        }

        let start = window.messages.len().saturating_sub(limit);
        Ok(Page {
            has_more: start > 0 || window.has_more,
            messages: window.messages[start..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryRecentCache;
    use crate::models::message::NewMessage;
    use crate::store::MemoryMessageStore;
    use chrono::Utc;

    async fn setup(n: usize) -> (HistoryService, Arc<MemoryMessageStore>, Arc<MemoryRecentCache>) {
        let store = Arc::new(MemoryMessageStore::new(0));
        for i in 1..=n {
            store
                .append(NewMessage {
                    group_id: "g1".into(),
                    sender_id: "u1".into(),
                    sender_name: "Alice".into(),
                    text: format!("m{i}"),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let cache = Arc::new(MemoryRecentCache::new());
        let service = HistoryService::new(store.clone(), cache.clone());
        (service, store, cache)
    }

    fn texts(page: &Page) -> Vec<String> {
        page.messages.iter().map(|m| m.text.clone()).collect()
    }

    #[test]
    fn limit_clamping() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-5)), 1);
        assert_eq!(clamp_limit(Some(10)), 10);
        assert_eq!(clamp_limit(Some(1000)), 100);
    }

    #[tokio::test]
    async fn first_page_miss_warms_cache() {
        let (service, _store, cache) = setup(60).await;
        assert!(cache.get("g1").await.unwrap().is_none());

        let page = service.load("g1", None, 10).await.unwrap();
        assert_eq!(texts(&page).first().unwrap(), "m51");
        assert_eq!(texts(&page).last().unwrap(), "m60");
        assert!(page.has_more);

        let cached = cache.get("g1").await.unwrap().unwrap();
        assert_eq!(cached.len(), 50);
        assert_eq!(cached[0].text, "m60");
    }

    #[tokio::test]
    async fn warmed_cache_serves_ten_newest() {
        let (service, store, _cache) = setup(50).await;
        service.load("g1", None, 50).await.unwrap();

        // The store going away proves the next page comes from the cache.
        store.set_unavailable(true);
        let page = service.load("g1", None, 10).await.unwrap();
        let expected: Vec<String> = (41..=50).map(|i| format!("m{i}")).collect();
        assert_eq!(texts(&page), expected);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn cached_set_shorter_than_limit_has_no_more() {
        let (service, store, _cache) = setup(4).await;
        let first = service.load("g1", None, 20).await.unwrap();
        assert_eq!(first.messages.len(), 4);
        assert!(!first.has_more);

        store.set_unavailable(true);
        let cached = service.load("g1", None, 20).await.unwrap();
        assert_eq!(texts(&cached), texts(&first));
        assert!(!cached.has_more);
    }

    #[tokio::test]
    async fn cursor_pages_bypass_cache() {
        let (service, store, cache) = setup(30).await;
        let newest = service.load("g1", None, 10).await.unwrap();
        let cursor = Cursor::BeforeId(newest.messages[0].id);

        let older = service.load("g1", Some(cursor), 10).await.unwrap();
        assert_eq!(texts(&older).first().unwrap(), "m11");
        assert_eq!(texts(&older).last().unwrap(), "m20");
        assert!(older.has_more);
        assert!(older.messages.iter().all(|m| cursor.admits(m)));

        store.set_unavailable(true);
        assert!(service.load("g1", Some(cursor), 10).await.is_err());
        assert!(cache.get("g1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn oversized_first_page_reads_store() {
        let (service, _store, cache) = setup(70).await;
        let page = service.load("g1", None, 80).await.unwrap();
        assert_eq!(page.messages.len(), 70);
        assert!(!page.has_more);
        assert!(cache.get("g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_group_is_not_cached() {
        let (service, _store, cache) = setup(0).await;
        let page = service.load("g1", None, 10).await.unwrap();
        assert!(page.messages.is_empty());
        assert!(!page.has_more);
        assert!(cache.get("g1").await.unwrap().is_none());
    }
}
