use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_gateway::auth::validator::KvSessionValidator;
use chat_gateway::cache::{MemoryRecentCache, RedisRecentCache};
use chat_gateway::config::Config;
use chat_gateway::db::kv::{KeyValueStore, RedisStore};
use chat_gateway::gateway::bus::RedisBus;
use chat_gateway::membership::KvMembership;
use chat_gateway::store::MemoryMessageStore;
use chat_gateway::{AppState, Backends};

/// How often expired in-memory cache entries are dropped.
const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let backends = match config.redis_url.as_deref() {
        Some(url) => {
            let bus = RedisBus::connect(url)
                .await
                .expect("failed to connect to Redis");
            let conn = bus.connection();
            let kv: Arc<dyn KeyValueStore> = Arc::new(RedisStore::new(conn.clone()));
            tracing::info!("using Redis bus, session store and recent cache");
            Backends {
                bus: Arc::new(bus),
                validator: Arc::new(KvSessionValidator::new(kv.clone())),
                membership: Arc::new(KvMembership::new(kv.clone())),
                kv,
                store: Arc::new(MemoryMessageStore::new(config.worker_id)),
                cache: Arc::new(RedisRecentCache::new(conn)),
            }
        }
        None => {
            tracing::warn!("REDIS_URL not set; running single-process with in-memory backends");
            let cache = Arc::new(MemoryRecentCache::new());
            spawn_cache_purge(cache.clone());
            Backends {
                cache,
                ..Backends::in_memory(config.worker_id)
            }
        }
    };

    let sweep_every = config.rate_limit_sweep_interval;
    let state = AppState::new(config, backends);
    state.limiter.clone().spawn_sweeper(sweep_every);
    state.listener.start();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(chat_gateway::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "chat-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    state.listener.shutdown();
    tracing::info!("chat-gateway stopped");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

fn spawn_cache_purge(cache: Arc<MemoryRecentCache>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_PURGE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, "purged expired recent-cache entries");
            }
        }
    });
}
