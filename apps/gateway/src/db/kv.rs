use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::StoreError;

/// Abstraction over a key-value store used for session tokens and
/// membership lookups shared with the rest of the platform.
///
/// Backed by Redis in production and an in-memory map in tests.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single process / tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.data
            .lock()
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut data = self.data.lock();
        match data.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                data.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await.map_err(|e| {
            tracing::error!(?e, "redis set failed");
            StoreError::from(e)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| {
            tracing::error!(?e, "redis get failed");
            StoreError::from(e)
        })
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(|e| {
            tracing::error!(?e, "redis del failed");
            StoreError::from(e)
        })
    }
}
