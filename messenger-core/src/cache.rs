use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;

/// Small in-process read-through cache used for rows that change rarely but
/// are read on every message (chat lookups, mostly). Entries live until
/// invalidated; there is no TTL because the dispatcher itself observes every
/// event that would make an entry stale.
pub struct ReadThroughCache<K, V> {
    entries: Arc<Mutex<HashMap<K, V>>>,
}

impl<K, V> Default for ReadThroughCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> ReadThroughCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value, loading and storing it on a miss. Absent
    /// values (loader returned `None`) are not cached, so a row created
    /// later is still found.
    pub async fn get_or_load<F, Fut>(&self, key: K, loader: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        {
            let entries = self.entries.lock().await;
            if let Some(value) = entries.get(&key) {
                return Ok(Some(value.clone()));
            }
        }

        let loaded = loader().await?;
        if let Some(value) = &loaded {
            let mut entries = self.entries.lock().await;
            entries.insert(key, value.clone());
        }
        Ok(loaded)
    }

    pub async fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
    }

    pub async fn invalidate_all(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn caches_hits_and_skips_absent_values() {
        let cache: ReadThroughCache<i64, String> = ReadThroughCache::new();
        let loads = AtomicUsize::new(0);

        let first = cache
            .get_or_load(1, || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Some("one".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("one"));

        let second = cache
            .get_or_load(1, || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Some("other".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(second.as_deref(), Some("one"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // Absent rows are re-queried every time.
        let missing = cache
            .get_or_load(2, || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
        assert!(missing.is_none());
        let missing_again = cache
            .get_or_load(2, || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
        assert!(missing_again.is_none());
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalidation_forces_reload() {
        let cache: ReadThroughCache<i64, i64> = ReadThroughCache::new();
        cache
            .get_or_load(1, || async { Ok(Some(10)) })
            .await
            .unwrap();
        cache.invalidate(&1).await;
        let reloaded = cache
            .get_or_load(1, || async { Ok(Some(20)) })
            .await
            .unwrap();
        assert_eq!(reloaded, Some(20));
    }
}
