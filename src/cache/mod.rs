//! Response cache: normalized keys, pluggable stores and the bookkeeping
//! the chat pipeline needs around them.
//!
//! Two stores ship: [`memory::MemoryCache`] (bounded LRU with TTL, one per
//! process) and [`redis::RedisCache`] (shared across instances, so the hit
//! rate does not depend on which instance served a request).
//!
//! Concurrent misses on the same key may both generate and the last write
//! wins, unless [`inflight::InflightRegistry`] is enabled.

pub mod inflight;
pub mod key;
pub mod memory;
pub mod redis;
pub mod sessions;

use async_trait::async_trait;

use crate::error::CacheError;
use crate::models::CacheEntry;

/// Key-value store for generated answers.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Look up a key. A hit returns exactly what was stored.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Store or overwrite a key.
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;

    /// Short backend name for health output and logs.
    fn backend_name(&self) -> &'static str;
}
