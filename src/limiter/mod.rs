pub mod config;
pub mod key;
mod store;

use crate::middleware::builder::HeaderCompatibleOutput;
use actix_web::rt::time::Instant;
use config::LimiterConfig;
use key::ClientKey;
use std::sync::Arc;
use std::time::Duration;
use store::{CounterStore, GcHandle};

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

// Reported as the reset time when the real one is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Admitted,
    /// Carries the configured rejection message.
    Rejected(String),
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Admitted => None,
            Self::Rejected(message) => Some(message),
        }
    }
}

/// Quota of a key after a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStatus {
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
    /// Number of requests that will be permitted until the window resets.
    pub remaining: u64,
    /// Time at which the window resets.
    pub reset: Instant,
}

impl HeaderCompatibleOutput for WindowStatus {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Seconds until the window resets (rounded upwards, so that it is guaranteed to be reset
    /// after waiting for the duration).
    fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }
}

/// Proof of an admitted request, which can be handed back to undo it.
#[derive(Clone)]
pub struct Admission {
    limiter: RateLimiter,
    key: ClientKey,
    window_start: Instant,
}

impl Admission {
    /// Removes this request from its key's count.
    ///
    /// Returns false (and changes nothing) if the window has since rolled over or the key was
    /// removed.
    pub fn rollback(self) -> bool {
        self.limiter
            .inner
            .store
            .rollback(&self.key, self.window_start)
    }

    pub fn key(&self) -> &ClientKey {
        &self.key
    }
}

struct Inner {
    config: LimiterConfig,
    store: Arc<CounterStore>,
    _gc: Option<GcHandle>,
}

/// Fixed window request counter, keyed per client.
///
/// Cloning is cheap and clones share counters; each limiter built separately has its own
/// counter namespace.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    pub fn builder(config: LimiterConfig) -> RateLimiterBuilder {
        RateLimiterBuilder {
            config,
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.inner.config
    }

    /// Decides whether the request from `key` at `now` is admitted.
    pub fn check(&self, key: &ClientKey, now: Instant) -> Decision {
        self.request(key, now).0
    }

    /// Same as [RateLimiter::check], additionally returning the key's quota and, when admitted,
    /// an [Admission] that allows the count to be rolled back.
    pub fn request(
        &self,
        key: &ClientKey,
        now: Instant,
    ) -> (Decision, WindowStatus, Option<Admission>) {
        let config = &self.inner.config;
        let hit = self
            .inner
            .store
            .hit(key, now, config.window(), config.max_requests());
        let status = WindowStatus {
            limit: config.max_requests(),
            remaining: config.max_requests().saturating_sub(hit.counter.count),
            reset: reset_time(hit.counter.window_start, config.window(), now),
        };
        if hit.admitted {
            let admission = Admission {
                limiter: self.clone(),
                key: key.clone(),
                window_start: hit.counter.window_start,
            };
            (Decision::Admitted, status, Some(admission))
        } else {
            log::debug!("Rate limit exceeded for {key}");
            let decision = Decision::Rejected(config.message().to_owned());
            (decision, status, None)
        }
    }

    /// Forgets the counter for `key`, restoring its full quota.
    pub fn reset_key(&self, key: &ClientKey) -> bool {
        self.inner.store.remove(key)
    }

    /// Evicts every counter whose window expired at `now`, returning how many were evicted.
    pub fn sweep(&self, now: Instant) -> usize {
        self.inner.store.sweep(now, self.inner.config.window())
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.inner.store.len()
    }
}

fn reset_time(window_start: Instant, window: Duration, now: Instant) -> Instant {
    window_start
        .checked_add(window)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

pub struct RateLimiterBuilder {
    config: LimiterConfig,
    gc_interval: Option<Duration>,
}

impl RateLimiterBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection. Enabling it requires that
    /// [build](RateLimiterBuilder::build) is called within an actix runtime.
    ///
    /// The garbage collector periodically scans the counters, removing expired windows.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval.filter(|i| !i.is_zero());
        self
    }

    pub fn build(self) -> RateLimiter {
        let store = Arc::new(CounterStore::default());
        let gc = self.gc_interval.map(|interval| {
            store::garbage_collector(store.clone(), self.config.window(), interval)
        });
        RateLimiter {
            inner: Arc::new(Inner {
                config: self.config,
                store,
                _gc: gc,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    const MINUTE: Duration = Duration::from_secs(60);

    fn key(s: &str) -> ClientKey {
        ClientKey::new(s).unwrap()
    }

    fn limiter(config: LimiterConfig) -> RateLimiter {
        RateLimiter::builder(config).with_gc_interval(None).build()
    }

    #[test]
    fn test_cap_enforcement() {
        let limiter = limiter(LimiterConfig::general());
        let start = Instant::now();
        for i in 0..5 {
            let now = start + Duration::from_secs(i * 10);
            assert_eq!(limiter.check(&key("1.2.3.4"), now), Decision::Admitted);
        }
        assert_eq!(
            limiter.check(&key("1.2.3.4"), start + MINUTE),
            Decision::Rejected("Too many requests, please try again later.".to_owned())
        );
        // Further requests stay rejected without consuming anything
        let (decision, status, admission) = limiter.request(&key("1.2.3.4"), start + MINUTE);
        assert!(decision.is_rejected());
        assert_eq!(status.remaining, 0);
        assert!(admission.is_none());
    }

    #[test]
    fn test_window_rollover() {
        let limiter = limiter(LimiterConfig::general());
        let start = Instant::now();
        for _ in 0..6 {
            limiter.check(&key("1.2.3.4"), start);
        }
        let later = start + Duration::from_secs(16 * 60);
        let (decision, status, _) = limiter.request(&key("1.2.3.4"), later);
        assert_eq!(decision, Decision::Admitted);
        assert_eq!(status.remaining, 4);
        assert_eq!(status.reset, later + Duration::from_secs(15 * 60));
        let counter = limiter.inner.store.get(&key("1.2.3.4")).unwrap();
        assert_eq!(counter.count, 1);
        assert_eq!(counter.window_start, later);
    }

    #[test]
    fn test_rollover_exactly_at_boundary() {
        let limiter = limiter(LimiterConfig::new(MINUTE, 1, "denied").unwrap());
        let start = Instant::now();
        assert!(limiter.check(&key("a"), start).is_admitted());
        assert!(limiter
            .check(&key("a"), start + MINUTE - Duration::from_millis(1))
            .is_rejected());
        assert!(limiter.check(&key("a"), start + MINUTE).is_admitted());
    }

    #[test]
    fn test_key_isolation() {
        let limiter = limiter(LimiterConfig::general());
        let now = Instant::now();
        for _ in 0..6 {
            limiter.check(&key("1.2.3.4"), now);
        }
        for _ in 0..5 {
            assert!(limiter.check(&key("5.6.7.8"), now).is_admitted());
        }
        assert!(limiter.check(&key("1.2.3.4"), now).is_rejected());
    }

    #[test]
    fn test_clock_backwards_keeps_window() {
        let limiter = limiter(LimiterConfig::new(MINUTE, 1, "denied").unwrap());
        let start = Instant::now() + MINUTE;
        assert!(limiter.check(&key("a"), start).is_admitted());
        let earlier = start - Duration::from_secs(30);
        assert_eq!(
            limiter.check(&key("a"), earlier),
            Decision::Rejected("denied".to_owned())
        );
        let counter = limiter.inner.store.get(&key("a")).unwrap();
        assert_eq!(counter.window_start, start);
    }

    #[test]
    fn test_concurrent_atomicity() {
        let limiter = limiter(LimiterConfig::new(MINUTE, 5, "denied").unwrap());
        let now = Instant::now();
        let threads = 32;
        let barrier = Barrier::new(threads);
        let admitted: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        limiter.check(&key("1.2.3.4"), now).is_admitted()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|admitted| *admitted)
                .count()
        });
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_independent_limiters() {
        let general = limiter(LimiterConfig::general());
        let login = limiter(LimiterConfig::login());
        let now = Instant::now();
        for _ in 0..5 {
            assert!(login.check(&key("1.2.3.4"), now).is_admitted());
        }
        assert_eq!(
            login.check(&key("1.2.3.4"), now).message(),
            Some("Too many login requests")
        );
        assert!(general.check(&key("1.2.3.4"), now).is_admitted());
    }

    #[test]
    fn test_rollback() {
        let limiter = limiter(LimiterConfig::new(MINUTE, 5, "denied").unwrap());
        let now = Instant::now();
        let (_, status, admission) = limiter.request(&key("a"), now);
        assert_eq!(status.remaining, 4);
        assert!(admission.unwrap().rollback());
        // Remaining should be the same, since the previous call was rolled back
        let (_, status, _) = limiter.request(&key("a"), now);
        assert_eq!(status.remaining, 4);
    }

    #[test]
    fn test_unbounded_window() {
        let limiter = limiter(LimiterConfig::new(Duration::MAX, 1, "denied").unwrap());
        let now = Instant::now();
        let (decision, status, _) = limiter.request(&key("a"), now);
        assert!(decision.is_admitted());
        assert!(status.reset > now);
        assert!(limiter
            .check(&key("a"), now + Duration::from_secs(86400 * 400))
            .is_rejected());
    }

    #[test]
    fn test_reset_key() {
        let limiter = limiter(LimiterConfig::new(MINUTE, 1, "denied").unwrap());
        let now = Instant::now();
        assert!(limiter.check(&key("a"), now).is_admitted());
        assert!(limiter.check(&key("a"), now).is_rejected());
        assert!(limiter.reset_key(&key("a")));
        assert!(limiter.check(&key("a"), now).is_admitted());
    }

    #[actix_web::test]
    async fn test_garbage_collection() {
        tokio::time::pause();
        let limiter = RateLimiter::builder(LimiterConfig::new(MINUTE, 1, "denied").unwrap())
            .with_gc_interval(Some(MINUTE))
            .build();
        limiter.check(&key("KEY1"), Instant::now());
        assert_eq!(limiter.tracked_keys(), 1);
        // Advance time such that the garbage collector runs, the expired KEY1 should be cleaned
        tokio::time::advance(MINUTE).await;
        assert!(limiter.inner.store.get(&key("KEY1")).is_none());
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[actix_web::test]
    async fn test_seconds_until_reset() {
        tokio::time::pause();
        let status = WindowStatus {
            limit: 0,
            remaining: 0,
            reset: Instant::now() + MINUTE,
        };
        tokio::time::advance(Duration::from_secs_f64(29.9)).await;
        // Verify rounded upwards from 30.1
        assert_eq!(status.seconds_until_reset(), 31);
    }
}
