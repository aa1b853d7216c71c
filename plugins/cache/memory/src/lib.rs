use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;

use ingest_api::ClientError;
use ingest_api::cache::CacheClient;

fn default_max_entries() -> usize {
    100_000
}

#[derive(Debug, serde::Deserialize)]
pub struct MemoryCacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// TTL key/value cache. Expired entries are dropped lazily on read and
/// swept when the cache reaches `max_entries`.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
    failing: AtomicBool,
    writes: AtomicU64,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: config.max_entries,
            failing: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    pub fn from_options(options: &serde_json::Value) -> Result<Self, ClientError> {
        let config: MemoryCacheConfig = serde_json::from_value(options.clone())
            .map_err(|e| ClientError::config(format!("memory cache config: {e}")))?;
        Ok(Self::new(config))
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries.values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful `set` calls since creation.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// While set, every write fails.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

impl CacheClient for MemoryCache {
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ClientError::io("memory cache unavailable"));
            }
            let now = Instant::now();
            let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
            if entries.len() >= self.max_entries && !entries.contains_key(key) {
                entries.retain(|_, e| e.expires_at > now);
                if entries.len() >= self.max_entries {
                    return Err(ClientError::io(format!(
                        "memory cache full ({} entries)",
                        self.max_entries
                    )));
                }
            }
            entries.insert(
                key.to_string(),
                CacheEntry {
                    value,
                    expires_at: now + ttl,
                },
            );
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemoryCache::default();
        cache.set("quote:AAPL", json!({"bid": 1.0}), Duration::from_secs(5)).await.unwrap();
        assert_eq!(cache.get("quote:AAPL"), Some(json!({"bid": 1.0})));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("quote:AAPL"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn later_write_wins() {
        let cache = MemoryCache::default();
        let ttl = Duration::from_secs(60);
        cache.set("k", json!(1), ttl).await.unwrap();
        cache.set("k", json!(2), ttl).await.unwrap();
        assert_eq!(cache.get("k"), Some(json!(2)));
        assert_eq!(cache.writes(), 2);
    }

    #[tokio::test]
    async fn full_cache_rejects_new_keys() {
        let cache = MemoryCache::new(MemoryCacheConfig { max_entries: 1 });
        let ttl = Duration::from_secs(60);
        cache.set("a", json!(1), ttl).await.unwrap();
        assert!(cache.set("b", json!(2), ttl).await.is_err());
        // Overwriting an existing key is still allowed.
        cache.set("a", json!(3), ttl).await.unwrap();
    }
}
