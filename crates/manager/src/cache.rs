use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{FutureExt, Shared};

type BoxedLoad<T> = Pin<Box<dyn Future<Output = Result<T, Arc<anyhow::Error>>> + Send + 'static>>;

struct Entry<T: Clone> {
    inserted: Instant,
    shared: Shared<BoxedLoad<T>>,
}

/// A TTL read-through cache that coalesces concurrent loads of the same key
/// into one underlying fetch by sharing the in-flight future.
///
/// Failed loads are dropped from the cache once observed, so errors are never
/// served beyond the callers that coalesced onto the failing fetch.
pub struct TtlCache<T: Clone> {
    store: Mutex<HashMap<String, Entry<T>>>,
    ttl: Duration,
    max_entries: usize,
}

impl<T: Clone + Send + Sync + 'static> TtlCache<T> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    pub async fn fetch<F, Fut>(&self, key: &str, load: F) -> Result<T, Arc<anyhow::Error>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let shared = {
            let mut store = self.store.lock().unwrap();

            if let Some(entry) = store.get(key) {
                if entry.inserted.elapsed() < self.ttl {
                    tracing::debug!(key, "cache hit");
                    entry.shared.clone()
                } else {
                    tracing::debug!(key, "cache stale");
                    store.remove(key);
                    self.insert_load(&mut store, key, load)
                }
            } else {
                tracing::debug!(key, "cache miss");
                self.insert_load(&mut store, key, load)
            }
        };

        let result = shared.await;
        if result.is_err() {
            self.invalidate(key);
        }
        result
    }

    pub fn invalidate(&self, key: &str) {
        let mut store = self.store.lock().unwrap();
        store.remove(key);
    }

    fn insert_load<F, Fut>(
        &self,
        store: &mut HashMap<String, Entry<T>>,
        key: &str,
        load: F,
    ) -> Shared<BoxedLoad<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        // Stay within the size bound: sweep expired entries first, then
        // fall back to evicting the oldest one.
        if store.len() >= self.max_entries {
            store.retain(|_, entry| entry.inserted.elapsed() < self.ttl);
        }
        while store.len() >= self.max_entries {
            let Some(oldest) = store
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            store.remove(&oldest);
        }

        let fut: BoxedLoad<T> = load().map(|res| res.map_err(Arc::new)).boxed();
        let shared = fut.shared();
        store.insert(
            key.to_string(),
            Entry {
                inserted: Instant::now(),
                shared: shared.clone(),
            },
        );
        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TEST_CAPACITY: usize = 64;

    #[tokio::test]
    async fn loads_once_within_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60), TEST_CAPACITY);
        let loads = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let loads = loads.clone();
            let got = cache
                .fetch("k", move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(got, 42);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_reload() {
        let cache = TtlCache::new(Duration::ZERO, TEST_CAPACITY);
        let loads = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let loads = loads.clone();
            cache
                .fetch("k", move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), TEST_CAPACITY);

        let err = cache
            .fetch("k", || async { anyhow::bail!("boom") })
            .await
            .unwrap_err();
        assert_eq!(format!("{err}"), "boom");

        let got = cache.fetch("k", || async { Ok(7) }).await.unwrap();
        assert_eq!(got, 7);
    }

    #[tokio::test]
    async fn size_bound_evicts_oldest() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), 2);
        let loads = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "c"] {
            cache.fetch(key, || async { Ok(0) }).await.unwrap();
        }

        // "a" was evicted to make room for "c"; "b" and "c" are still held.
        for (key, expected_loads) in [("b", 0), ("c", 0), ("a", 1)] {
            let loads_for_fetch = loads.clone();
            cache
                .fetch(key, move || async move {
                    loads_for_fetch.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                })
                .await
                .unwrap();
            assert_eq!(loads.load(Ordering::SeqCst), expected_loads, "key {key}");
        }
    }

    #[tokio::test]
    async fn concurrent_fetches_coalesce() {
        let cache: Arc<TtlCache<u32>> = Arc::new(TtlCache::new(Duration::from_secs(60), TEST_CAPACITY));
        let loads = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let loads = loads.clone();
                tokio::spawn(async move {
                    cache
                        .fetch("k", move || async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(1u32)
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
