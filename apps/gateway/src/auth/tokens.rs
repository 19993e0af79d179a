//! Opaque client session tokens stored in the shared key-value store.
//!
//! Tokens are minted by the platform's login flow (or `issue-token` in
//! development). Only a SHA-256 digest of the token is used as the key, so a
//! dump of the store does not leak usable credentials.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::kv::KeyValueStore;
use crate::error::StoreError;

/// Session TTL in seconds (24 hours).
pub const SESSION_TTL_SECS: u64 = 24 * 3600;

/// Data stored alongside a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub user_id: String,
}

/// Generate an opaque random token with the given prefix.
pub fn generate_opaque_token(prefix: &str, bytes: usize) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(&mut buf[..]);
    format!("{}_{}", prefix, URL_SAFE_NO_PAD.encode(&buf))
}

pub fn generate_session_token() -> String {
    generate_opaque_token(chat_common::id::prefix::SESSION, 32)
}

fn session_key(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("chat:session:{hex}")
}

pub async fn store_session(
    kv: &dyn KeyValueStore,
    token: &str,
    data: &SessionData,
    ttl_secs: u64,
) -> Result<(), StoreError> {
    let value = serde_json::to_string(data)?;
    kv.set_ex(&session_key(token), &value, ttl_secs).await
}

pub async fn lookup_session(
    kv: &dyn KeyValueStore,
    token: &str,
) -> Result<Option<SessionData>, StoreError> {
    match kv.get(&session_key(token)).await? {
        Some(v) => Ok(Some(serde_json::from_str(&v)?)),
        None => Ok(None),
    }
}

pub async fn revoke_session(kv: &dyn KeyValueStore, token: &str) -> Result<(), StoreError> {
    kv.del(&session_key(token)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryStore;

    #[test]
    fn generated_tokens_are_prefixed_and_unique() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert!(a.starts_with("cst_"));
        assert_ne!(a, b);
    }

    #[test]
    fn session_key_does_not_contain_token() {
        let key = session_key("cst_secret");
        assert!(key.starts_with("chat:session:"));
        assert!(!key.contains("secret"));
        assert_eq!(key.len(), "chat:session:".len() + 64);
    }

    #[tokio::test]
    async fn store_lookup_revoke() {
        let kv = MemoryStore::new();
        let data = SessionData {
            user_id: "u1".into(),
        };
        store_session(&kv, "tok", &data, 60).await.unwrap();
        assert_eq!(lookup_session(&kv, "tok").await.unwrap(), Some(data));
        assert!(lookup_session(&kv, "other").await.unwrap().is_none());

        revoke_session(&kv, "tok").await.unwrap();
        assert!(lookup_session(&kv, "tok").await.unwrap().is_none());
    }
}
