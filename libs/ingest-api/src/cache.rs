use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::ClientError;

/// Low-latency key/value cache. Writes are best-effort.
pub trait CacheClient: Send + Sync {
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>>;
}
