use std::time::Duration;

/// Token-bucket parameters for one route class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Sustained refill rate.
    pub per_minute: u32,
    /// Bucket capacity; a fresh key may spend this many tokens at once.
    pub burst: u32,
}

impl BucketConfig {
    pub const fn new(per_minute: u32, burst: u32) -> Self {
        Self { per_minute, burst }
    }
}

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Redis connection string. When unset the gateway runs single-process
    /// with in-memory bus, KV and cache.
    pub redis_url: Option<String>,
    /// Snowflake worker id for message ids assigned by this process.
    pub worker_id: u16,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_buffer: usize,
    /// Number of background persistence workers.
    pub store_workers: usize,
    /// Total bound of the persistence queues, split evenly across workers.
    pub store_queue: usize,
    pub history_authenticated: BucketConfig,
    pub history_anonymous: BucketConfig,
    /// Per-IP bucket in front of the WebSocket upgrade / token validation.
    pub connect: BucketConfig,
    /// Buckets untouched for this long are swept.
    pub rate_limit_idle_ttl: Duration,
    pub rate_limit_sweep_interval: Duration,
    /// Push freshly persisted messages into an existing recent-cache entry.
    pub cache_warm_on_append: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4010,
            redis_url: None,
            worker_id: 0,
            outbound_buffer: 256,
            store_workers: 4,
            store_queue: 1024,
            history_authenticated: BucketConfig::new(30, 20),
            history_anonymous: BucketConfig::new(10, 5),
            connect: BucketConfig::new(30, 10),
            rate_limit_idle_ttl: Duration::from_secs(30 * 60),
            rate_limit_sweep_interval: Duration::from_secs(60),
            cache_warm_on_append: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            port: parsed_var("PORT").unwrap_or(d.port),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            worker_id: parsed_var("WORKER_ID").unwrap_or(d.worker_id),
            outbound_buffer: parsed_var("OUTBOUND_BUFFER")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.outbound_buffer),
            store_workers: parsed_var("STORE_WORKERS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.store_workers),
            store_queue: parsed_var("STORE_QUEUE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.store_queue),
            history_authenticated: bucket_var(
                "HISTORY_AUTH_PER_MINUTE",
                "HISTORY_AUTH_BURST",
                d.history_authenticated,
            ),
            history_anonymous: bucket_var(
                "HISTORY_ANON_PER_MINUTE",
                "HISTORY_ANON_BURST",
                d.history_anonymous,
            ),
            connect: bucket_var("CONNECT_PER_MINUTE", "CONNECT_BURST", d.connect),
            rate_limit_idle_ttl: parsed_var("RATE_LIMIT_IDLE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.rate_limit_idle_ttl),
            rate_limit_sweep_interval: parsed_var("RATE_LIMIT_SWEEP_SECS")
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.rate_limit_sweep_interval),
            cache_warm_on_append: parsed_var("CACHE_WARM_ON_APPEND")
                .unwrap_or(d.cache_warm_on_append),
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn bucket_var(rate: &str, burst: &str, default: BucketConfig) -> BucketConfig {
    BucketConfig {
        per_minute: parsed_var(rate)
            .filter(|n: &u32| *n > 0)
            .unwrap_or(default.per_minute),
        burst: parsed_var(burst)
            .filter(|n: &u32| *n > 0)
            .unwrap_or(default.burst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = Config::default();
        assert_eq!(config.history_authenticated, BucketConfig::new(30, 20));
        assert_eq!(config.history_anonymous, BucketConfig::new(10, 5));
        assert_eq!(config.rate_limit_idle_ttl, Duration::from_secs(1800));
        assert!(config.redis_url.is_none());
        assert!(!config.cache_warm_on_append);
    }
}
