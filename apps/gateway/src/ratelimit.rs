//! Per-caller token buckets for the history endpoint and connection entry.
//!
//! Bucket state is kept as accumulated credit time rather than fractional
//! tokens: one token costs `60s / per_minute`, and a bucket holds at most
//! `burst` tokens worth of credit. Integer durations keep refill exact.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{BucketConfig, Config};
use crate::error::RateLimitInfo;

/// Which guarded entry point a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    History,
    Connect,
}

/// Bucket owner: authenticated callers by identity, everyone else by IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    User(String),
    Ip(String),
}

struct Bucket {
    credit: Duration,
    cost: Duration,
    capacity: Duration,
    per_minute: u32,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: BucketConfig, now: Instant) -> Self {
        let cost = Duration::from_secs(60) / config.per_minute.max(1);
        let capacity = cost * config.burst.max(1);
        Self {
            credit: capacity,
            cost,
            capacity,
            per_minute: config.per_minute,
            last_refill: now,
        }
    }

    fn credit_at(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_refill);
        (self.credit + elapsed).min(self.capacity)
    }

    fn take(&mut self, now: Instant) -> Result<(), RateLimitInfo> {
        self.credit = self.credit_at(now);
        self.last_refill = now;

        if self.credit >= self.cost {
            self.credit -= self.cost;
            return Ok(());
        }
        Err(self.exhausted(self.credit))
    }

    /// Like `take`, but leaves the bucket untouched.
    fn peek(&self, now: Instant) -> Result<(), RateLimitInfo> {
        let credit = self.credit_at(now);
        if credit >= self.cost {
            return Ok(());
        }
        Err(self.exhausted(credit))
    }

    fn exhausted(&self, credit: Duration) -> RateLimitInfo {
        let wait = self.cost - credit;
        let retry_after_secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        RateLimitInfo {
            limit: self.per_minute,
            retry_after_secs: retry_after_secs.max(1),
        }
    }
}

pub struct RateLimiter {
    buckets: DashMap<(Caller, RouteClass), Bucket>,
    history_authenticated: BucketConfig,
    history_anonymous: BucketConfig,
    connect: BucketConfig,
    idle_ttl: Duration,
}

impl RateLimiter {
    pub fn new(config: &Config) -> Self {
        Self {
            buckets: DashMap::new(),
            history_authenticated: config.history_authenticated,
            history_anonymous: config.history_anonymous,
            connect: config.connect,
            idle_ttl: config.rate_limit_idle_ttl,
        }
    }

    fn bucket_config(&self, caller: &Caller, class: RouteClass) -> BucketConfig {
        match (class, caller) {
            (RouteClass::History, Caller::User(_)) => self.history_authenticated,
            (RouteClass::History, Caller::Ip(_)) => self.history_anonymous,
            (RouteClass::Connect, _) => self.connect,
        }
    }

    /// Spend one token, or report how long to back off.
    pub fn check(&self, caller: &Caller, class: RouteClass) -> Result<(), RateLimitInfo> {
        self.check_at(caller, class, Instant::now())
    }

    pub fn check_at(
        &self,
        caller: &Caller,
        class: RouteClass,
        now: Instant,
    ) -> Result<(), RateLimitInfo> {
        let config = self.bucket_config(caller, class);
        self.buckets
            .entry((caller.clone(), class))
            .or_insert_with(|| Bucket::new(config, now))
            .take(now)
    }

    /// Report whether `check` would succeed without spending a token. A
    /// caller with no bucket yet always passes.
    pub fn peek(&self, caller: &Caller, class: RouteClass) -> Result<(), RateLimitInfo> {
        self.peek_at(caller, class, Instant::now())
    }

    pub fn peek_at(
        &self,
        caller: &Caller,
        class: RouteClass,
        now: Instant,
    ) -> Result<(), RateLimitInfo> {
        match self.buckets.get(&(caller.clone(), class)) {
            Some(bucket) => bucket.peek(now),
            None => Ok(()),
        }
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Remove buckets idle for longer than the configured TTL.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last_refill) < self.idle_ttl);
        before - self.buckets.len()
    }

    /// Periodically sweep idle buckets for the lifetime of the process.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await; // First tick fires immediately; skip it.
            loop {
                ticker.tick().await;
                let removed = self.sweep_idle();
                if removed > 0 {
                    tracing::debug!(removed, remaining = self.len(), "swept idle rate-limit buckets");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(&Config::default())
    }

    fn anon(ip: &str) -> Caller {
        Caller::Ip(ip.to_string())
    }

    #[test]
    fn burst_then_reject_then_one_per_interval() {
        let limiter = limiter();
        let caller = anon("1.2.3.4");
        let t0 = Instant::now();

        for i in 0..5 {
            assert!(limiter.check_at(&caller, RouteClass::History, t0).is_ok(), "request {i}");
        }
        let info = limiter
            .check_at(&caller, RouteClass::History, t0)
            .unwrap_err();
        assert_eq!(info.limit, 10);
        assert_eq!(info.retry_after_secs, 6);

        // 10/minute refills one token every 6 seconds.
        let t1 = t0 + Duration::from_secs(6);
        assert!(limiter.check_at(&caller, RouteClass::History, t1).is_ok());
        assert!(limiter.check_at(&caller, RouteClass::History, t1).is_err());
    }

    #[test]
    fn authenticated_bucket_is_larger() {
        let limiter = limiter();
        let user = Caller::User("u1".into());
        let t0 = Instant::now();

        for _ in 0..20 {
            assert!(limiter.check_at(&user, RouteClass::History, t0).is_ok());
        }
        let info = limiter.check_at(&user, RouteClass::History, t0).unwrap_err();
        assert_eq!(info.limit, 30);
        assert_eq!(info.retry_after_secs, 2);
    }

    #[test]
    fn partial_refill_reports_remaining_wait() {
        let limiter = limiter();
        let caller = anon("1.2.3.4");
        let t0 = Instant::now();
        for _ in 0..5 {
            limiter.check_at(&caller, RouteClass::History, t0).unwrap();
        }
        let info = limiter
            .check_at(&caller, RouteClass::History, t0 + Duration::from_millis(4500))
            .unwrap_err();
        assert_eq!(info.retry_after_secs, 2);
    }

    #[test]
    fn refill_caps_at_burst() {
        let limiter = limiter();
        let caller = anon("1.2.3.4");
        let t0 = Instant::now();
        limiter.check_at(&caller, RouteClass::History, t0).unwrap();

        let later = t0 + Duration::from_secs(3600);
        for _ in 0..5 {
            assert!(limiter.check_at(&caller, RouteClass::History, later).is_ok());
        }
        assert!(limiter.check_at(&caller, RouteClass::History, later).is_err());
    }

    #[test]
    fn peek_does_not_spend() {
        let limiter = limiter();
        let caller = anon("1.2.3.4");
        let t0 = Instant::now();

        assert!(limiter.peek_at(&caller, RouteClass::History, t0).is_ok());
        assert!(limiter.is_empty());

        for _ in 0..5 {
            limiter.check_at(&caller, RouteClass::History, t0).unwrap();
        }
        let info = limiter
            .peek_at(&caller, RouteClass::History, t0)
            .unwrap_err();
        assert_eq!(info.retry_after_secs, 6);

        let t1 = t0 + Duration::from_secs(6);
        for _ in 0..3 {
            assert!(limiter.peek_at(&caller, RouteClass::History, t1).is_ok());
        }
        assert!(limiter.check_at(&caller, RouteClass::History, t1).is_ok());
        assert!(limiter.peek_at(&caller, RouteClass::History, t1).is_err());
    }

    #[test]
    fn keys_and_classes_are_independent() {
        let limiter = limiter();
        let t0 = Instant::now();
        for _ in 0..5 {
            limiter.check_at(&anon("a"), RouteClass::History, t0).unwrap();
        }
        assert!(limiter.check_at(&anon("a"), RouteClass::History, t0).is_err());
        assert!(limiter.check_at(&anon("b"), RouteClass::History, t0).is_ok());
        assert!(limiter.check_at(&anon("a"), RouteClass::Connect, t0).is_ok());
        assert!(limiter
            .check_at(&Caller::User("a".into()), RouteClass::History, t0)
            .is_ok());
        assert_eq!(limiter.len(), 4);
    }

    #[test]
    fn sweep_removes_only_idle_buckets() {
        let limiter = limiter();
        let t0 = Instant::now();
        limiter.check_at(&anon("old"), RouteClass::History, t0).unwrap();
        limiter
            .check_at(&anon("fresh"), RouteClass::History, t0 + Duration::from_secs(25 * 60))
            .unwrap();

        let removed = limiter.sweep_idle_at(t0 + Duration::from_secs(31 * 60));
        assert_eq!(removed, 1);
        assert_eq!(limiter.len(), 1);

        // A swept caller starts over with a full bucket.
        let t2 = t0 + Duration::from_secs(32 * 60);
        for _ in 0..5 {
            assert!(limiter.check_at(&anon("old"), RouteClass::History, t2).is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_periodically() {
        let mut config = Config::default();
        config.rate_limit_idle_ttl = Duration::from_secs(1);
        let limiter = Arc::new(RateLimiter::new(&config));
        limiter.check(&anon("a"), RouteClass::History).unwrap();

        let handle = limiter.clone().spawn_sweeper(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(limiter.is_empty());
        handle.abort();
    }
}
