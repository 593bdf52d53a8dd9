use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::ResponseCache;
use crate::error::CacheError;
use crate::models::CacheEntry;

/// Answer cache shared by every server instance through Redis.
///
/// Entries are stored as JSON with `SET .. EX ttl`, so expiry is handled
/// by Redis itself.
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
    ttl_secs: u64,
}

impl RedisCache {
    pub async fn connect(url: &str, prefix: &str, ttl_secs: u64) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            ttl_secs: ttl_secs.max(1),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        namespaced_key(&self.prefix, key)
    }
}

fn namespaced_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

fn encode(entry: &CacheEntry) -> Result<String, CacheError> {
    serde_json::to_string(entry).map_err(|e| CacheError::Corrupt(e.to_string()))
}

fn decode(raw: &str) -> Result<CacheEntry, CacheError> {
    serde_json::from_str(raw).map_err(|e| CacheError::Corrupt(e.to_string()))
}

#[async_trait]
impl ResponseCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.namespaced(key))
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        raw.as_deref().map(decode).transpose()
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let payload = encode(&entry)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.namespaced(key), payload, self.ttl_secs)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
