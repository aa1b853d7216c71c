use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ingest_api::cache::CacheClient;

use crate::batch::{Batch, CommitOutcome, RecordStatus};
use crate::error::IngestFault;
use crate::metrics::PipelineMetrics;

/// Mirrors cache-relevant fields of written records into the cache.
///
/// Runs strictly after a successful commit. Failures are counted and logged
/// but never fail the batch or hold up acknowledgment.
pub struct CacheUpdater {
    cache: Option<Arc<dyn CacheClient>>,
    metrics: Arc<PipelineMetrics>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheUpdateSummary {
    pub written: usize,
    pub failed: usize,
}

struct CacheWrite {
    ts_ms: i64,
    value: serde_json::Value,
    ttl: Duration,
}

impl CacheUpdater {
    pub fn new(cache: Option<Arc<dyn CacheClient>>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { cache, metrics }
    }

    pub async fn update(&self, outcome: &CommitOutcome, batch: &Batch) -> CacheUpdateSummary {
        let mut summary = CacheUpdateSummary::default();
        let Some(cache) = &self.cache else {
            return summary;
        };

        // Latest value per key within the batch.
        let mut latest: BTreeMap<String, CacheWrite> = BTreeMap::new();
        for (entry, status) in batch.entries().iter().zip(outcome.statuses()) {
            if *status != RecordStatus::Written {
                continue;
            }
            let Some(policy) = entry.validator.cache_policy() else {
                continue;
            };
            let record = &entry.record;
            let key = format!("{}:{}", record.schema_id, record.natural_key);
            if latest.get(&key).is_some_and(|w| w.ts_ms > record.ts_ms) {
                continue;
            }

            let mut value = serde_json::Map::with_capacity(policy.fields.len() + 1);
            for name in &policy.fields {
                if let Some(v) = record.fields.get(name) {
                    value.insert(name.clone(), v.clone());
                }
            }
            value.insert("ts_ms".into(), record.ts_ms.into());
            latest.insert(
                key,
                CacheWrite {
                    ts_ms: record.ts_ms,
                    value: serde_json::Value::Object(value),
                    ttl: policy.ttl,
                },
            );
        }

        for (key, write) in latest {
            match cache.set(&key, write.value, write.ttl).await {
                Ok(()) => {
                    summary.written += 1;
                    self.metrics.cache_writes.fetch_add(1, Ordering::Relaxed);
                }
                Err(source) => {
                    summary.failed += 1;
                    self.metrics.cache_failures.fetch_add(1, Ordering::Relaxed);
                    let fault = IngestFault::CacheWriteFailure { key, source };
                    tracing::warn!(batch_id = outcome.batch_id, error = %fault, "cache update skipped");
                }
            }
        }
        summary
    }
}
