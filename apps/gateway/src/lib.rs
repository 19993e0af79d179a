pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod history;
pub mod membership;
pub mod models;
pub mod ratelimit;
pub mod routes;
pub mod store;

use std::sync::Arc;

use auth::validator::{KvSessionValidator, SessionValidator};
use cache::{MemoryRecentCache, RecentCache};
use config::Config;
use db::kv::{KeyValueStore, MemoryStore};
use gateway::bus::{Bus, MemoryBus};
use gateway::listener::BusListener;
use gateway::publisher::Publisher;
use gateway::registry::ConnectionRegistry;
use history::HistoryService;
use membership::{KvMembership, MembershipChecker};
use ratelimit::RateLimiter;
use store::writer::StoreWriter;
use store::{MemoryMessageStore, MessageStore};

/// External collaborators the gateway is wired to.
#[derive(Clone)]
pub struct Backends {
    pub bus: Arc<dyn Bus>,
    pub kv: Arc<dyn KeyValueStore>,
    pub validator: Arc<dyn SessionValidator>,
    pub membership: Arc<dyn MembershipChecker>,
    pub store: Arc<dyn MessageStore>,
    pub cache: Arc<dyn RecentCache>,
}

impl Backends {
    /// Everything held in process memory. Sessions and memberships are read
    /// from the in-memory KV store.
    pub fn in_memory(worker_id: u16) -> Self {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        Self {
            bus: Arc::new(MemoryBus::new()),
            validator: Arc::new(KvSessionValidator::new(kv.clone())),
            membership: Arc::new(KvMembership::new(kv.clone())),
            kv,
            store: Arc::new(MemoryMessageStore::new(worker_id)),
            cache: Arc::new(MemoryRecentCache::new()),
        }
    }
}

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub kv: Arc<dyn KeyValueStore>,
    pub validator: Arc<dyn SessionValidator>,
    pub membership: Arc<dyn MembershipChecker>,
    pub registry: Arc<ConnectionRegistry>,
    pub publisher: Publisher,
    pub listener: Arc<BusListener>,
    pub store_writer: StoreWriter,
    pub history: Arc<HistoryService>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Wire up the gateway and start the persistence workers. The bus
    /// listener is started separately (or lazily by the first connection).
    pub fn new(config: Config, backends: Backends) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let listener = Arc::new(BusListener::new(backends.bus.clone(), registry.clone()));

        let warm_cache = config.cache_warm_on_append.then(|| backends.cache.clone());
        let (store_writer, _workers) = StoreWriter::spawn(
            backends.store.clone(),
            warm_cache,
            config.store_workers,
            config.store_queue,
        );

        Self {
            limiter: Arc::new(RateLimiter::new(&config)),
            history: Arc::new(HistoryService::new(backends.store, backends.cache)),
            publisher: Publisher::new(backends.bus),
            config: Arc::new(config),
            kv: backends.kv,
            validator: backends.validator,
            membership: backends.membership,
            registry,
            listener,
            store_writer,
        }
    }
}
