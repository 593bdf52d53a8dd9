use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

use super::ResponseCache;
use crate::error::CacheError;
use crate::models::CacheEntry;

struct Slot {
    entry: CacheEntry,
    stored_at: Instant,
}

/// Process-local answer cache bounded by entry count, with per-entry TTL.
///
/// Each server instance holds its own copy, so in a multi-instance
/// deployment prefer [`super::redis::RedisCache`].
pub struct MemoryCache {
    slots: Mutex<LruCache<String, Slot>>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut slots = self.slots.lock();
        let expired = match slots.get(key) {
            None => return Ok(None),
            Some(slot) => slot.stored_at.elapsed() >= self.ttl,
        };
        if expired {
            slots.pop(key);
            return Ok(None);
        }
        Ok(slots.peek(key).map(|slot| slot.entry.clone()))
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.slots.lock().put(
            key.to_string(),
            Slot {
                entry,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
