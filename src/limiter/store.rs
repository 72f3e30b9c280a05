use crate::limiter::key::ClientKey;
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Per key bookkeeping for the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowCounter {
    pub(crate) window_start: Instant,
    pub(crate) count: u64,
}

/// Result of a single hit against the store.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Hit {
    pub(crate) admitted: bool,
    pub(crate) counter: WindowCounter,
}

/// Counters sharded across the [DashMap], so that the read-check-increment sequence for a key
/// runs under that key's shard lock.
#[derive(Default)]
pub(crate) struct CounterStore {
    map: DashMap<ClientKey, WindowCounter>,
}

impl CounterStore {
    pub(crate) fn hit(
        &self,
        key: &ClientKey,
        now: Instant,
        window: Duration,
        max_requests: u64,
    ) -> Hit {
        let mut entry = self
            .map
            .entry(key.clone())
            .or_insert_with(|| WindowCounter {
                window_start: now,
                count: 0,
            });
        let counter = entry.value_mut();
        // A clock that went backwards saturates to zero and stays in the current window
        if now.saturating_duration_since(counter.window_start) >= window {
            counter.window_start = now;
            counter.count = 0;
        }
        let admitted = counter.count < max_requests;
        if admitted {
            counter.count += 1;
        }
        Hit {
            admitted,
            counter: *counter,
        }
    }

    /// Decrements the count, unless the window has rolled over since `window_start`.
    pub(crate) fn rollback(&self, key: &ClientKey, window_start: Instant) -> bool {
        match self.map.get_mut(key) {
            Some(mut counter) if counter.window_start == window_start => {
                counter.count = counter.count.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove(&self, key: &ClientKey) -> bool {
        self.map.remove(key).is_some()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: &ClientKey) -> Option<WindowCounter> {
        self.map.get(key).map(|c| *c)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Removes counters whose window has expired, returning how many were removed.
    pub(crate) fn sweep(&self, now: Instant, window: Duration) -> usize {
        let before = self.map.len();
        self.map
            .retain(|_k, c| now.saturating_duration_since(c.window_start) < window);
        before.saturating_sub(self.map.len())
    }
}

/// Aborts the garbage collector once the last limiter handle is dropped.
pub(crate) struct GcHandle(JoinHandle<()>);

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// None when the interval reaches past any representable instant, i.e. never sweep again.
fn next_sweep(now: Instant, interval: Duration) -> Option<Instant> {
    now.checked_add(interval)
}

pub(crate) fn garbage_collector(
    store: Arc<CounterStore>,
    window: Duration,
    interval: Duration,
) -> GcHandle {
    let handle = actix_web::rt::spawn(async move {
        loop {
            let now = Instant::now();
            let removed = store.sweep(now, window);
            log::trace!("Rate limit sweep removed {removed} expired counters");
            match next_sweep(now, interval) {
                Some(next) => actix_web::rt::time::sleep_until(next).await,
                None => break,
            }
        }
    });
    GcHandle(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn key(s: &str) -> ClientKey {
        ClientKey::new(s).unwrap()
    }

    #[test]
    fn test_rejected_hits_do_not_count() {
        let store = CounterStore::default();
        let now = Instant::now();
        assert!(store.hit(&key("a"), now, MINUTE, 1).admitted);
        for _ in 0..3 {
            let hit = store.hit(&key("a"), now, MINUTE, 1);
            assert!(!hit.admitted);
            assert_eq!(hit.counter.count, 1);
        }
    }

    #[test]
    fn test_rollback_ignores_old_window() {
        let store = CounterStore::default();
        let start = Instant::now();
        let first = store.hit(&key("a"), start, MINUTE, 5);
        let later = start + MINUTE;
        store.hit(&key("a"), later, MINUTE, 5);
        assert!(!store.rollback(&key("a"), first.counter.window_start));
        assert_eq!(store.get(&key("a")).unwrap().count, 1);
        assert!(store.rollback(&key("a"), later));
        assert_eq!(store.get(&key("a")).unwrap().count, 0);
    }

    #[test]
    fn test_next_sweep() {
        let now = Instant::now();
        assert_eq!(next_sweep(now, MINUTE), Some(now + MINUTE));
        assert_eq!(next_sweep(now, Duration::MAX), None);
    }

    #[actix_web::test]
    async fn test_gc_with_unbounded_interval() {
        tokio::time::pause();
        let store = Arc::new(CounterStore::default());
        let gc = garbage_collector(store.clone(), MINUTE, Duration::MAX);
        store.hit(&key("a"), Instant::now(), MINUTE, 5);
        tokio::time::advance(MINUTE).await;
        // The single sweep ran and the task finished without panicking
        assert_eq!(store.len(), 0);
        tokio::task::yield_now().await;
        assert!(gc.0.is_finished());
    }

    #[test]
    fn test_sweep() {
        let store = CounterStore::default();
        let start = Instant::now();
        store.hit(&key("old"), start, MINUTE, 5);
        store.hit(&key("new"), start + Duration::from_secs(30), MINUTE, 5);
        assert_eq!(store.sweep(start + MINUTE, MINUTE), 1);
        assert!(store.get(&key("old")).is_none());
        assert!(store.get(&key("new")).is_some());
        assert_eq!(store.len(), 1);
    }
}
