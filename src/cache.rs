//! TTL cache with single-flight refresh.
//!
//! Each key is either `Ready` (a value and the instant it was fetched) or
//! `Pending` (a shared handle to the one refresh in flight). A fresh `Ready`
//! value is served under a read lock only. A miss or an expired entry starts
//! exactly one refresh; every other caller for that key awaits the same
//! shared result.
//!
//! Refreshes run on a spawned task bounded by `refresh_timeout`. The task
//! records its own outcome, so a caller that gives up waiting never cancels
//! a refresh others still depend on, and never leaves one unrecorded.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{BridgeError, Result};

type Flight<V> = Shared<BoxFuture<'static, Result<V>>>;

type Slots<K, V> = Arc<RwLock<HashMap<K, Slot<V>>>>;

struct ReadySlot<V> {
    value: V,
    fetched_at: Instant,
    generation: u64,
}

enum Slot<V> {
    Ready(ReadySlot<V>),
    Pending {
        flight: Flight<V>,
        generation: u64,
        /// Value being replaced by a forced refresh, restored if it fails.
        previous: Option<ReadySlot<V>>,
    },
}

/// A cached value and the refresh generation that produced it.
#[derive(Debug, Clone)]
pub struct Entry<V> {
    pub value: V,
    pub generation: u64,
}

enum Lookup<V> {
    Hit(Entry<V>),
    Wait(Flight<V>, u64),
}

/// Keyed TTL cache whose misses are coalesced into one remote fetch.
pub struct RefreshCache<K, V> {
    /// Name used in logs and error reasons.
    name: &'static str,
    ttl: Duration,
    refresh_timeout: Duration,
    /// Error kind reported when a refresh times out or aborts.
    unavailable: fn(String) -> BridgeError,
    slots: Slots<K, V>,
    next_generation: AtomicU64,
}

impl<K, V> RefreshCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        ttl: Duration,
        refresh_timeout: Duration,
        unavailable: fn(String) -> BridgeError,
    ) -> Self {
        Self {
            name,
            ttl,
            refresh_timeout,
            unavailable,
            slots: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Return the cached value for `key`, fetching it if absent or expired.
    pub async fn get_or_fetch<F, Fut>(&self, key: &K, fetch: F) -> Result<Entry<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(entry) = self.fresh(key)? {
            return Ok(entry);
        }

        match self.join_or_start(key, None, fetch)? {
            Lookup::Hit(entry) => Ok(entry),
            Lookup::Wait(flight, generation) => flight.await.map(|value| Entry { value, generation }),
        }
    }

    /// Replace the value produced by `stale_generation` with a fresh fetch.
    ///
    /// Nothing is fetched when the entry has already moved past
    /// `stale_generation`, or when it is younger than `min_age`; concurrent
    /// callers reporting the same stale generation share one fetch.
    pub async fn refetch<F, Fut>(
        &self,
        key: &K,
        stale_generation: u64,
        min_age: Duration,
        fetch: F,
    ) -> Result<Entry<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        match self.join_or_start(key, Some((stale_generation, min_age)), fetch)? {
            Lookup::Hit(entry) => Ok(entry),
            Lookup::Wait(flight, generation) => flight.await.map(|value| Entry { value, generation }),
        }
    }

    fn fresh(&self, key: &K) -> Result<Option<Entry<V>>> {
        let slots = self.slots.read().map_err(|_| self.poisoned())?;
        Ok(match slots.get(key) {
            Some(Slot::Ready(ready)) if ready.fetched_at.elapsed() < self.ttl => Some(Entry {
                value: ready.value.clone(),
                generation: ready.generation,
            }),
            _ => None,
        })
    }

    fn join_or_start<F, Fut>(
        &self,
        key: &K,
        force: Option<(u64, Duration)>,
        fetch: F,
    ) -> Result<Lookup<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut slots = self.slots.write().map_err(|_| self.poisoned())?;

        let previous = match slots.remove(key) {
            Some(Slot::Pending {
                flight,
                generation,
                previous,
            }) => {
                let joined = flight.clone();
                slots.insert(
                    key.clone(),
                    Slot::Pending {
                        flight,
                        generation,
                        previous,
                    },
                );
                return Ok(Lookup::Wait(joined, generation));
            }
            Some(Slot::Ready(ready)) => {
                let fresh = ready.fetched_at.elapsed() < self.ttl;
                let keep = match force {
                    None => fresh,
                    Some((stale, min_age)) => {
                        fresh && (ready.generation != stale || ready.fetched_at.elapsed() < min_age)
                    }
                };
                if keep {
                    let entry = Entry {
                        value: ready.value.clone(),
                        generation: ready.generation,
                    };
                    slots.insert(key.clone(), Slot::Ready(ready));
                    return Ok(Lookup::Hit(entry));
                }
                fresh.then_some(ready)
            }
            None => None,
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        debug!(cache = self.name, generation, "Starting cache refresh");

        let fut = fetch();
        let name = self.name;
        let timeout = self.refresh_timeout;
        let unavailable = self.unavailable;
        let shared_slots = Arc::clone(&self.slots);
        let owned_key = key.clone();
        let task = tokio::spawn(async move {
            let mut fetch_task = tokio::spawn(fut);
            let result = match tokio::time::timeout(timeout, &mut fetch_task).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(unavailable(format!("{} refresh aborted: {}", name, e))),
                Err(_) => {
                    fetch_task.abort();
                    Err(unavailable(format!(
                        "{} refresh timed out after {:?}",
                        name, timeout
                    )))
                }
            };
            record(&shared_slots, &owned_key, generation, &result, name);
            result
        });
        let flight = async move {
            task.await.unwrap_or_else(|e| {
                Err(unavailable(format!("{} refresh aborted: {}", name, e)))
            })
        }
        .boxed()
        .shared();

        slots.insert(
            key.clone(),
            Slot::Pending {
                flight: flight.clone(),
                generation,
                previous,
            },
        );

        Ok(Lookup::Wait(flight, generation))
    }

    fn poisoned(&self) -> BridgeError {
        (self.unavailable)(format!("{} cache lock poisoned", self.name))
    }
}

/// Store the outcome of refresh `generation` if it is still the current one.
fn record<K, V>(slots: &Slots<K, V>, key: &K, generation: u64, result: &Result<V>, name: &'static str)
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let Ok(mut slots) = slots.write() else {
        debug!(cache = name, generation, "Cache lock poisoned, refresh not recorded");
        return;
    };
    let current = matches!(
        slots.get(key),
        Some(Slot::Pending { generation: g, .. }) if *g == generation
    );
    if !current {
        return;
    }
    if let Some(Slot::Pending { previous, .. }) = slots.remove(key) {
        match result {
            Ok(value) => {
                slots.insert(
                    key.clone(),
                    Slot::Ready(ReadySlot {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                        generation,
                    }),
                );
            }
            Err(e) => {
                debug!(cache = name, generation, error = %e, "Cache refresh failed");
                if let Some(previous) = previous {
                    slots.insert(key.clone(), Slot::Ready(previous));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn cache(ttl_secs: u64) -> Arc<RefreshCache<String, u64>> {
        Arc::new(RefreshCache::new(
            "test",
            Duration::from_secs(ttl_secs),
            Duration::from_secs(5),
            BridgeError::KeySetUnavailable,
        ))
    }

    fn counted(calls: &Arc<AtomicUsize>, value: u64) -> impl Future<Output = Result<u64>> + Send + 'static {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(value)
        }
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let cache = cache(60);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&"k".to_string(), || counted(&calls, 7))
                    .await
            }));
        }

        for handle in handles {
            let entry = handle.await.unwrap().unwrap();
            assert_eq!(entry.value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refetched() {
        let cache = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "k".to_string();

        let first = cache.get_or_fetch(&key, || counted(&calls, 1)).await.unwrap();
        let again = cache.get_or_fetch(&key, || counted(&calls, 2)).await.unwrap();
        assert_eq!(again.value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(11)).await;

        let refreshed = cache.get_or_fetch(&key, || counted(&calls, 2)).await.unwrap();
        assert_eq!(refreshed.value, 2);
        assert!(refreshed.generation > first.generation);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_times_out_for_every_waiter() {
        let cache: Arc<RefreshCache<String, u64>> = Arc::new(RefreshCache::new(
            "test",
            Duration::from_secs(60),
            Duration::from_secs(2),
            BridgeError::TrustAnchorUnavailable,
        ));

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&"k".to_string(), || std::future::pending::<Result<u64>>())
                    .await
            })
        };
        let b = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&"k".to_string(), || std::future::pending::<Result<u64>>())
                    .await
            })
        };

        for handle in [a, b] {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, BridgeError::TrustAnchorUnavailable(ref r) if r.contains("timed out")));
        }

        // A failed refresh is not cached.
        let ok = cache
            .get_or_fetch(&"k".to_string(), || async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(ok.value, 3);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_cancel_refresh() {
        let cache = cache(60);
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&"k".to_string(), || counted(&calls, 9))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let follower = cache
            .get_or_fetch(&"k".to_string(), || counted(&calls, 10))
            .await
            .unwrap();
        assert_eq!(follower.value, 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_refresh_expires_with_ttl() {
        let cache = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let only = {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&"k".to_string(), || counted(&calls, 1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        only.abort();
        // Let the refresh finish with no one waiting on it.
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::advance(Duration::from_secs(3600)).await;

        let entry = cache
            .get_or_fetch(&"k".to_string(), || counted(&calls, 2))
            .await
            .unwrap();
        assert_eq!(entry.value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_failure_is_not_replayed() {
        let cache = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let only = {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&"k".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(BridgeError::KeySetUnavailable("blip".into()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        only.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let entry = cache
            .get_or_fetch(&"k".to_string(), || counted(&calls, 5))
            .await
            .unwrap();
        assert_eq!(entry.value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_refresh_served_within_ttl() {
        let cache = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let only = {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&"k".to_string(), || counted(&calls, 1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        only.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let entry = cache
            .get_or_fetch(&"k".to_string(), || counted(&calls, 2))
            .await
            .unwrap();
        assert_eq!(entry.value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refetch_once_per_stale_generation() {
        let cache = cache(60);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "k".to_string();

        let first = cache.get_or_fetch(&key, || counted(&calls, 1)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .refetch(&key, first.generation, Duration::ZERO, || counted(&calls, 2))
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().value, 2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Reporting the old generation again does not trigger another fetch.
        let entry = cache
            .refetch(&key, first.generation, Duration::ZERO, || counted(&calls, 3))
            .await
            .unwrap();
        assert_eq!(entry.value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refetch_respects_min_age() {
        let cache = cache(60);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "k".to_string();

        let first = cache.get_or_fetch(&key, || counted(&calls, 1)).await.unwrap();
        let entry = cache
            .refetch(&key, first.generation, Duration::from_secs(30), || counted(&calls, 2))
            .await
            .unwrap();
        assert_eq!(entry.value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_previous_value() {
        let cache = cache(60);
        let key = "k".to_string();

        let first = cache.get_or_fetch(&key, || async { Ok(1) }).await.unwrap();
        let err = cache
            .refetch(&key, first.generation, Duration::ZERO, || async {
                Err(BridgeError::KeySetUnavailable("down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::KeySetUnavailable(_)));

        let entry = cache
            .get_or_fetch(&key, || async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(entry.value, 1);
    }
}
