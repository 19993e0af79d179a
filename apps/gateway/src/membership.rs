//! Group-membership authorization for posting.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::auth::Identity;
use crate::db::kv::KeyValueStore;
use crate::error::StoreError;

/// Decides whether an identity may post into a group.
///
/// Returns the sender's display name for the group when allowed and
/// `Ok(None)` when not.
#[async_trait]
pub trait MembershipChecker: Send + Sync {
    async fn can_post(&self, identity: &Identity, group_id: &str)
        -> Result<Option<String>, StoreError>;
}

/// In-process membership table, used for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryMembership {
    groups: DashMap<String, HashMap<String, String>>,
}

impl MemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, group_id: &str, user_id: &str, display_name: &str) {
        self.groups
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string(), display_name.to_string());
    }

    pub fn remove_member(&self, group_id: &str, user_id: &str) {
        if let Some(mut members) = self.groups.get_mut(group_id) {
            members.remove(user_id);
        }
    }
}

#[async_trait]
impl MembershipChecker for MemoryMembership {
    async fn can_post(
        &self,
        identity: &Identity,
        group_id: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .groups
            .get(group_id)
            .and_then(|members| members.get(&identity.user_id).cloned()))
    }
}

/// Membership records maintained by the platform in the shared key-value
/// store: `chat:member:<group_id>:<user_id>` holds the display name.
pub struct KvMembership {
    kv: Arc<dyn KeyValueStore>,
}

impl KvMembership {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn member_key(group_id: &str, user_id: &str) -> String {
        format!("chat:member:{group_id}:{user_id}")
    }
}

#[async_trait]
impl MembershipChecker for KvMembership {
    async fn can_post(
        &self,
        identity: &Identity,
        group_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let name = self
            .kv
            .get(&Self::member_key(group_id, &identity.user_id))
            .await?;
        // An empty record still grants access; fall back to the user id.
        Ok(name.map(|n| {
            if n.trim().is_empty() {
                identity.user_id.clone()
            } else {
                n
            }
        }))
    }
}
