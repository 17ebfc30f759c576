use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{error::CacheResult, traits::Cache};

/// One stored value. Recency is a stamp from the cache-wide generation
/// counter rather than a wall-clock read: bumping it on a hit only needs a
/// shared reference, so reads never take a write lock on the shard.
struct StoredValue {
    bytes: Vec<u8>,
    deadline: Option<Instant>,
    last_used: AtomicU64,
}

impl StoredValue {
    fn is_dead(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }
}

/// In-process cache backed by a `DashMap`.
///
/// Capacity is enforced at insert time: once the map is full, a sweep drops
/// every expired entry and, if that is not enough, trims the least recently
/// touched survivors down to a low-water mark so inserts do not sweep again
/// immediately.
///
/// **WARNING**: not suitable for multi-replica deployments. Each gateway
/// process keeps an independent cache, so invalidations and single-flight
/// wins do not propagate. Use the Redis backend there.
pub struct MemoryCache {
    entries: DashMap<String, StoredValue>,
    generation: AtomicU64,
    capacity: usize,
    evict_chunk: usize,
}

impl MemoryCache {
    pub fn new(capacity: usize, evict_chunk: usize) -> Self {
        Self {
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
            capacity,
            evict_chunk: evict_chunk.max(1),
        }
    }

    fn next_stamp(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn store_value(&self, value: &[u8], ttl: Duration) -> StoredValue {
        StoredValue {
            bytes: value.to_vec(),
            deadline: (!ttl.is_zero()).then(|| Instant::now() + ttl),
            last_used: AtomicU64::new(self.next_stamp()),
        }
    }

    /// Free capacity for one insert. A single sweep drops dead entries and
    /// records each survivor's recency stamp; only when the sweep alone is
    /// not enough are the stalest survivors trimmed.
    fn make_room(&self) {
        if self.entries.len() < self.capacity {
            return;
        }

        let now = Instant::now();
        let mut survivors: Vec<(String, u64)> = Vec::with_capacity(self.entries.len());
        self.entries.retain(|key, value| {
            if value.is_dead(now) {
                return false;
            }
            survivors.push((key.clone(), value.last_used.load(Ordering::Relaxed)));
            true
        });

        let low_water = self.capacity.saturating_sub(self.evict_chunk);
        if survivors.len() <= low_water {
            return;
        }

        survivors.sort_unstable_by_key(|(_, stamp)| *stamp);
        for (key, _) in survivors.iter().take(survivors.len() - low_water) {
            self.entries.remove(key);
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_dead(now) {
                entry.last_used.store(self.next_stamp(), Ordering::Relaxed);
                return Ok(Some(entry.bytes.clone()));
            }
        } else {
            return Ok(None);
        }

        // Lazily reap the expired entry, but only if it is still the one we
        // just saw; a concurrent re-insert must survive.
        self.entries.remove_if(key, |_, value| value.is_dead(now));
        Ok(None)
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.make_room();
        self.entries
            .insert(key.to_string(), self.store_value(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.make_room();

        // The entry API makes check-and-insert atomic; a dead occupant
        // counts as absent.
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_dead(Instant::now()) {
                    occupied.insert(self.store_value(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.store_value(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn get_set_bytes() {
        let cache = MemoryCache::new(100, 10);

        cache
            .set_bytes("key1", b"value1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get_bytes("key1").await.unwrap(),
            Some(b"value1".to_vec())
        );

        assert_eq!(cache.get_bytes("nonexistent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = MemoryCache::new(100, 10);

        cache
            .set_bytes("key1", b"value1", Duration::from_secs(60))
            .await
            .unwrap();
        cache.delete("key1").await.unwrap();
        assert!(cache.get_bytes("key1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ttl_expiration() {
        let cache = MemoryCache::new(100, 10);

        // 200ms TTL to avoid flakiness
        cache
            .set_bytes("expiring", b"value", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(cache.get_bytes("expiring").await.unwrap().is_some());

        sleep(Duration::from_millis(300)).await;
        assert!(cache.get_bytes("expiring").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_ttl_means_no_expiration() {
        let cache = MemoryCache::new(100, 10);

        cache
            .set_bytes("forever", b"value", Duration::from_secs(0))
            .await
            .unwrap();
        assert!(cache.get_bytes("forever").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn set_nx_new_key() {
        let cache = MemoryCache::new(100, 10);

        let result = cache
            .set_nx("new_key", b"value", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(result, "first set_nx should succeed");
        assert_eq!(
            cache.get_bytes("new_key").await.unwrap(),
            Some(b"value".to_vec())
        );
    }

    #[tokio::test]
    async fn set_nx_existing_key_keeps_original() {
        let cache = MemoryCache::new(100, 10);

        cache
            .set_bytes("existing", b"original", Duration::from_secs(60))
            .await
            .unwrap();

        let result = cache
            .set_nx("existing", b"new_value", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!result, "set_nx should fail for existing key");
        assert_eq!(
            cache.get_bytes("existing").await.unwrap(),
            Some(b"original".to_vec())
        );
    }

    #[tokio::test]
    async fn set_nx_replaces_expired_key() {
        let cache = MemoryCache::new(100, 10);

        cache
            .set_bytes("expiring", b"original", Duration::from_millis(100))
            .await
            .unwrap();
        sleep(Duration::from_millis(200)).await;

        let result = cache
            .set_nx("expiring", b"new_value", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(result, "set_nx should succeed for expired key");
        assert_eq!(
            cache.get_bytes("expiring").await.unwrap(),
            Some(b"new_value".to_vec())
        );
    }

    #[tokio::test]
    async fn reads_refresh_recency() {
        // Generation stamps order recency, so no sleeps are needed to
        // separate accesses.
        let cache = MemoryCache::new(3, 1);

        cache
            .set_bytes("key1", b"v1", Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set_bytes("key2", b"v2", Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set_bytes("key3", b"v3", Duration::from_secs(60))
            .await
            .unwrap();

        // Touch key1; key2 is now the stalest.
        cache.get_bytes("key1").await.unwrap();

        cache
            .set_bytes("key4", b"v4", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.get_bytes("key1").await.unwrap().is_some());
        assert!(cache.get_bytes("key2").await.unwrap().is_none());
        assert!(cache.get_bytes("key3").await.unwrap().is_some());
        assert!(cache.get_bytes("key4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_drops_dead_entries_before_live_ones() {
        let cache = MemoryCache::new(4, 2);

        cache
            .set_bytes("dead1", b"v", Duration::from_millis(50))
            .await
            .unwrap();
        cache
            .set_bytes("dead2", b"v", Duration::from_millis(50))
            .await
            .unwrap();
        cache
            .set_bytes("live1", b"v", Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set_bytes("live2", b"v", Duration::from_secs(60))
            .await
            .unwrap();

        sleep(Duration::from_millis(100)).await;

        // Reclaiming the two dead entries is enough; no live entry goes.
        cache
            .set_bytes("new", b"new", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.get_bytes("dead1").await.unwrap().is_none());
        assert!(cache.get_bytes("dead2").await.unwrap().is_none());
        assert!(cache.get_bytes("live1").await.unwrap().is_some());
        assert!(cache.get_bytes("live2").await.unwrap().is_some());
        assert!(cache.get_bytes("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn trim_reaches_low_water_mark() {
        let cache = MemoryCache::new(4, 2);

        for i in 0..4 {
            cache
                .set_bytes(&format!("key{i}"), b"v", Duration::from_secs(60))
                .await
                .unwrap();
        }

        // Nothing is expired, so the two stalest entries are trimmed to
        // make room (low-water mark = capacity - evict_chunk).
        cache
            .set_bytes("new", b"v", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.get_bytes("key0").await.unwrap().is_none());
        assert!(cache.get_bytes("key1").await.unwrap().is_none());
        assert!(cache.get_bytes("key2").await.unwrap().is_some());
        assert!(cache.get_bytes("key3").await.unwrap().is_some());
        assert!(cache.get_bytes("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn overwrite_value() {
        let cache = MemoryCache::new(100, 10);

        cache
            .set_bytes("key", b"first", Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set_bytes("key", b"second", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            cache.get_bytes("key").await.unwrap(),
            Some(b"second".to_vec())
        );
    }
}
