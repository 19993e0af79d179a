#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;

use chat_gateway::auth::tokens::{self, SessionData, SESSION_TTL_SECS};
use chat_gateway::auth::validator::KvSessionValidator;
use chat_gateway::cache::MemoryRecentCache;
use chat_gateway::config::Config;
use chat_gateway::db::kv::{KeyValueStore, MemoryStore};
use chat_gateway::gateway::bus::MemoryBus;
use chat_gateway::membership::MemoryMembership;
use chat_gateway::store::MemoryMessageStore;
use chat_gateway::{AppState, Backends};

/// Collaborators shared by every gateway process of a test cluster, the way
/// Redis and the database are shared in production.
#[derive(Clone)]
pub struct Shared {
    pub bus: Arc<MemoryBus>,
    pub kv: Arc<dyn KeyValueStore>,
    pub membership: Arc<MemoryMembership>,
    pub store: Arc<MemoryMessageStore>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(MemoryBus::new()),
            kv: Arc::new(MemoryStore::new()),
            membership: Arc::new(MemoryMembership::new()),
            store: Arc::new(MemoryMessageStore::new(1)),
        }
    }

    /// Build one gateway process on top of the shared collaborators. Each
    /// process gets its own recent cache, registry and listener.
    pub fn node(&self, config: Config) -> AppState {
        let backends = Backends {
            bus: self.bus.clone(),
            kv: self.kv.clone(),
            validator: Arc::new(KvSessionValidator::new(self.kv.clone())),
            membership: self.membership.clone(),
            store: self.store.clone(),
            cache: Arc::new(MemoryRecentCache::new()),
        };
        AppState::new(config, backends)
    }

    /// Store a fresh session token for `user_id`.
    pub async fn issue_token(&self, user_id: &str) -> String {
        let token = tokens::generate_session_token();
        tokens::store_session(
            self.kv.as_ref(),
            &token,
            &SessionData {
                user_id: user_id.to_string(),
            },
            SESSION_TTL_SECS,
        )
        .await
        .expect("store session");
        token
    }
}

pub fn test_config() -> Config {
    Config {
        store_workers: 1,
        ..Config::default()
    }
}

/// A single-process gateway with its own collaborators.
pub fn test_state() -> (AppState, Shared) {
    let shared = Shared::new();
    let state = shared.node(test_config());
    (state, shared)
}

pub fn test_app() -> (Router, AppState, Shared) {
    let (state, shared) = test_state();
    let app = chat_gateway::routes::router().with_state(state.clone());
    (app, state, shared)
}

/// Serve `state` on an ephemeral port with its bus listener running.
pub async fn start_server(state: AppState) -> SocketAddr {
    state.listener.start();
    state.listener.wait_until_connected().await;

    let app = chat_gateway::routes::router().with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    addr
}
