use std::sync::Arc;

use async_trait::async_trait;

use super::tokens;
use super::Identity;
use crate::db::kv::KeyValueStore;
use crate::error::StoreError;

/// Resolves a client-supplied token to an identity.
///
/// `Ok(None)` means the token is unknown or expired; `Err` means the
/// backing service could not be reached.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Option<Identity>, StoreError>;
}

/// Validates tokens against sessions stored in the shared key-value store.
pub struct KvSessionValidator {
    kv: Arc<dyn KeyValueStore>,
}

impl KvSessionValidator {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl SessionValidator for KvSessionValidator {
    async fn validate(&self, token: &str) -> Result<Option<Identity>, StoreError> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(None);
        }
        Ok(tokens::lookup_session(self.kv.as_ref(), token)
            .await?
            .map(|data| Identity::new(data.user_id)))
    }
}
