//! Short-lived per-group cache of the newest messages.
//!
//! Entries hold at most [`RECENT_CACHE_SIZE`] messages, newest at the head,
//! and expire [`RECENT_CACHE_TTL`] after the last write to them. The cache is
//! filled by the history service on a first-page miss; the live fan-out path
//! never writes to it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::StoreError;
use crate::models::message::StoredMessage;

/// Maximum number of messages cached per group.
pub const RECENT_CACHE_SIZE: usize = 50;

/// Rolling expiry, refreshed on every write to an entry.
pub const RECENT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[async_trait]
pub trait RecentCache: Send + Sync {
    /// Cached messages for a group, newest first. `None` on a miss.
    async fn get(&self, group_id: &str) -> Result<Option<Vec<StoredMessage>>, StoreError>;

    /// Replace a group's entry with `oldest_first` (as returned by the
    /// store). Keeps only the newest [`RECENT_CACHE_SIZE`]. An empty slice
    /// leaves the cache untouched.
    async fn warm(&self, group_id: &str, oldest_first: &[StoredMessage]) -> Result<(), StoreError>;

    /// Prepend a message to an existing entry. Groups without an entry stay
    /// uncached so a partial list is never mistaken for the newest page.
    async fn push_if_cached(&self, group_id: &str, message: &StoredMessage)
        -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct CacheEntry {
    newest_first: VecDeque<StoredMessage>,
    expires_at: Instant,
}

pub struct MemoryRecentCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl Default for MemoryRecentCache {
    fn default() -> Self {
        Self::with_ttl(RECENT_CACHE_TTL)
    }
}

impl MemoryRecentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }
}

#[async_trait]
impl RecentCache for MemoryRecentCache {
    async fn get(&self, group_id: &str) -> Result<Option<Vec<StoredMessage>>, StoreError> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(group_id)
            .filter(|e| e.expires_at > now)
            .map(|e| e.newest_first.iter().cloned().collect());
        if hit.is_none() {
            self.entries.remove_if(group_id, |_, e| e.expires_at <= now);
        }
        Ok(hit)
    }

    async fn warm(&self, group_id: &str, oldest_first: &[StoredMessage]) -> Result<(), StoreError> {
        if oldest_first.is_empty() {
            return Ok(());
        }
        let newest_first: VecDeque<StoredMessage> = oldest_first
            .iter()
            .rev()
            .take(RECENT_CACHE_SIZE)
            .cloned()
            .collect();
        self.entries.insert(
            group_id.to_string(),
            CacheEntry {
                newest_first,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn push_if_cached(
        &self,
        group_id: &str,
        message: &StoredMessage,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(group_id) {
            if entry.expires_at <= now {
                return Ok(());
            }
            entry.newest_first.push_front(message.clone());
            entry.newest_first.truncate(RECENT_CACHE_SIZE);
            entry.expires_at = now + self.ttl;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis implementation: one list per group, newest at index 0.
// ---------------------------------------------------------------------------

pub struct RedisRecentCache {
    conn: ConnectionManager,
}

impl RedisRecentCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(group_id: &str) -> String {
        format!("chat:recent:{group_id}")
    }
}

#[async_trait]
impl RecentCache for RedisRecentCache {
    async fn get(&self, group_id: &str) -> Result<Option<Vec<StoredMessage>>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(Self::key(group_id), 0, -1).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        let messages = raw
            .iter()
            .map(|s| serde_json::from_str(s))
            .collect::<Result<Vec<StoredMessage>, _>>()?;
        Ok(Some(messages))
    }

    async fn warm(&self, group_id: &str, oldest_first: &[StoredMessage]) -> Result<(), StoreError> {
        if oldest_first.is_empty() {
            return Ok(());
        }
        let newest_first = oldest_first
            .iter()
            .rev()
            .take(RECENT_CACHE_SIZE)
            .map(serde_json::to_string)
            .collect::<Result<Vec<String>, _>>()?;

        let key = Self::key(group_id);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(&key)
            .ignore()
            .rpush(&key, newest_first)
            .ignore()
            .expire(&key, RECENT_CACHE_TTL.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_if_cached(
        &self,
        group_id: &str,
        message: &StoredMessage,
    ) -> Result<(), StoreError> {
        let key = Self::key(group_id);
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        // LPUSHX is a no-op on a missing key; EXPIRE on a missing key too.
        let _: () = redis::pipe()
            .atomic()
            .lpush_exists(&key, payload)
            .ignore()
            .ltrim(&key, 0, RECENT_CACHE_SIZE as isize - 1)
            .ignore()
            .expire(&key, RECENT_CACHE_TTL.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
