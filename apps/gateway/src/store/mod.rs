//! Durable message storage contract and the in-process implementation.

pub mod writer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chat_common::SnowflakeGenerator;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::models::message::{Cursor, DeliveryStatus, NewMessage, StoredMessage};

/// One page of history, oldest-first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub messages: Vec<StoredMessage>,
    pub has_more: bool,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning its id.
    async fn append(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    /// Up to `limit` messages strictly before `before` (or the newest ones
    /// when `None`), returned oldest-first. `has_more` is set when older
    /// messages exist beyond the page.
    async fn query(
        &self,
        group_id: &str,
        before: Option<Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError>;
}

/// Message store held in process memory.
pub struct MemoryMessageStore {
    ids: SnowflakeGenerator,
    groups: Mutex<HashMap<String, Vec<StoredMessage>>>,
    unavailable: AtomicBool,
}

impl MemoryMessageStore {
    pub fn new(worker_id: u16) -> Self {
        Self {
            ids: SnowflakeGenerator::new(worker_id),
            groups: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of messages persisted for a group.
    pub fn len(&self, group_id: &str) -> usize {
        self.groups.lock().get(group_id).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, group_id: &str) -> bool {
        self.len(group_id) == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        self.check_available()?;

        let mut groups = self.groups.lock();
        let stored = StoredMessage {
            id: self.ids.generate(),
            group_id: message.group_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            text: message.text,
            created_at: message.created_at,
            status: DeliveryStatus::Sent,
        };
        groups
            .entry(stored.group_id.clone())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn query(
        &self,
        group_id: &str,
        before: Option<Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        self.check_available()?;

        let groups = self.groups.lock();
        let Some(messages) = groups.get(group_id) else {
            return Ok(Page::default());
        };

        // Ids are issued in append order, so the vec is already oldest-first.
        let eligible: Vec<&StoredMessage> = messages
            .iter()
            .filter(|m| before.map_or(true, |c| c.admits(m)))
            .collect();

        let start = eligible.len().saturating_sub(limit);
        Ok(Page {
            messages: eligible[start..].iter().map(|m| (*m).clone()).collect(),
            has_more: start > 0,
        })
    }
}
