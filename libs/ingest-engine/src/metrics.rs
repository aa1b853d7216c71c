//! Pipeline telemetry.
//!
//! Counters are lock-free atomics; distributions and per-partition gauges sit
//! behind short-lived mutexes. [`PipelineMetrics::snapshot`] produces the JSON
//! served by the API and [`report_loop`] writes the same numbers to the log.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use ingest_api::PartitionId;

use crate::batch::CloseTrigger;
use crate::compactor::CompactionJob;

/// Rolling window of samples with percentile queries.
#[derive(Debug)]
pub struct SampleWindow {
    samples: VecDeque<u64>,
    capacity: usize,
    total: u64,
    count: u64,
    max: u64,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
            count: 0,
            max: 0,
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.total = self.total.saturating_add(value);
        self.count += 1;
        self.max = self.max.max(value);
    }

    pub fn percentile(&self, p: u8) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (sorted.len() - 1) * p.min(100) as usize / 100;
        Some(sorted[idx])
    }

    pub fn summary(&self) -> SampleSummary {
        SampleSummary {
            count: self.count,
            last: self.samples.back().copied(),
            max: self.max,
            mean: if self.count == 0 { 0.0 } else { self.total as f64 / self.count as f64 },
            p50: self.percentile(50),
            p99: self.percentile(99),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleSummary {
    pub count: u64,
    pub last: Option<u64>,
    pub max: u64,
    pub mean: f64,
    pub p50: Option<u64>,
    pub p99: Option<u64>,
}

pub struct PipelineMetrics {
    // Consumption
    pub messages_received: AtomicU64,
    pub messages_redelivered: AtomicU64,
    pub records_validated: AtomicU64,
    pub validation_rejections: AtomicU64,

    // Batching
    pub batches_closed_by_size: AtomicU64,
    pub batches_closed_by_time: AtomicU64,
    pub batches_closed_by_shutdown: AtomicU64,
    batch_size: Mutex<SampleWindow>,
    batch_latency_ms: Mutex<SampleWindow>,

    // Writing
    pub batches_committed: AtomicU64,
    pub batches_failed: AtomicU64,
    pub records_written: AtomicU64,
    pub records_store_rejected: AtomicU64,
    pub write_retries: AtomicU64,

    // Cache
    pub cache_writes: AtomicU64,
    pub cache_failures: AtomicU64,

    // Acknowledgment
    pub acks: AtomicU64,
    pub nacks: AtomicU64,
    pub ack_failures: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub dead_letter_failures: AtomicU64,

    // Compaction
    pub compaction_runs: AtomicU64,
    pub compaction_failures: AtomicU64,
    last_compaction: Mutex<Option<CompactionJob>>,

    consumer_lag: Mutex<BTreeMap<PartitionId, u64>>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_redelivered: AtomicU64::new(0),
            records_validated: AtomicU64::new(0),
            validation_rejections: AtomicU64::new(0),
            batches_closed_by_size: AtomicU64::new(0),
            batches_closed_by_time: AtomicU64::new(0),
            batches_closed_by_shutdown: AtomicU64::new(0),
            batch_size: Mutex::new(SampleWindow::new(1_000)),
            batch_latency_ms: Mutex::new(SampleWindow::new(1_000)),
            batches_committed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            records_store_rejected: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
            cache_writes: AtomicU64::new(0),
            cache_failures: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
            ack_failures: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            dead_letter_failures: AtomicU64::new(0),
            compaction_runs: AtomicU64::new(0),
            compaction_failures: AtomicU64::new(0),
            last_compaction: Mutex::new(None),
            consumer_lag: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record_received(&self, redelivery: bool) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        if redelivery {
            self.messages_redelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_batch_closed(&self, trigger: CloseTrigger, size: usize) {
        let counter = match trigger {
            CloseTrigger::Size => &self.batches_closed_by_size,
            CloseTrigger::Time => &self.batches_closed_by_time,
            CloseTrigger::Shutdown => &self.batches_closed_by_shutdown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut window) = self.batch_size.lock() {
            window.record(size as u64);
        }
    }

    /// Record a resolved batch: latency is measured from open to outcome.
    pub fn record_batch_resolved(&self, committed: bool, latency: Duration) {
        if committed {
            self.batches_committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut window) = self.batch_latency_ms.lock() {
            window.record(latency.as_millis() as u64);
        }
    }

    pub fn set_lag(&self, partition: PartitionId, lag: u64) {
        if let Ok(mut lags) = self.consumer_lag.lock() {
            lags.insert(partition, lag);
        }
    }

    pub fn lag(&self, partition: PartitionId) -> Option<u64> {
        self.consumer_lag.lock().ok()?.get(&partition).copied()
    }

    pub fn record_compaction(&self, job: CompactionJob) {
        self.compaction_runs.fetch_add(1, Ordering::Relaxed);
        if job.failure.is_some() {
            self.compaction_failures.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut last) = self.last_compaction.lock() {
            *last = Some(job);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let received = load(&self.messages_received);
        let dead_lettered = load(&self.dead_lettered);
        let consumer_lag = self.consumer_lag.lock().map(|l| l.clone()).unwrap_or_default();
        let empty = || SampleWindow::new(0).summary();

        MetricsSnapshot {
            messages_received: received,
            messages_redelivered: load(&self.messages_redelivered),
            records_validated: load(&self.records_validated),
            validation_rejections: load(&self.validation_rejections),
            batches_closed_by_size: load(&self.batches_closed_by_size),
            batches_closed_by_time: load(&self.batches_closed_by_time),
            batches_closed_by_shutdown: load(&self.batches_closed_by_shutdown),
            batch_size: self.batch_size.lock().map(|w| w.summary()).unwrap_or_else(|_| empty()),
            batch_latency_ms: self
                .batch_latency_ms
                .lock()
                .map(|w| w.summary())
                .unwrap_or_else(|_| empty()),
            batches_committed: load(&self.batches_committed),
            batches_failed: load(&self.batches_failed),
            records_written: load(&self.records_written),
            records_store_rejected: load(&self.records_store_rejected),
            write_retries: load(&self.write_retries),
            cache_writes: load(&self.cache_writes),
            cache_failures: load(&self.cache_failures),
            acks: load(&self.acks),
            nacks: load(&self.nacks),
            ack_failures: load(&self.ack_failures),
            dead_lettered,
            dead_letter_failures: load(&self.dead_letter_failures),
            dead_letter_rate: if received == 0 {
                0.0
            } else {
                dead_lettered as f64 / received as f64
            },
            total_consumer_lag: consumer_lag.values().sum(),
            consumer_lag,
            compaction_runs: load(&self.compaction_runs),
            compaction_failures: load(&self.compaction_failures),
            last_compaction: self.last_compaction.lock().ok().and_then(|j| j.clone()),
        }
    }
}

/// Point-in-time copy of all metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_redelivered: u64,
    pub records_validated: u64,
    pub validation_rejections: u64,
    pub batches_closed_by_size: u64,
    pub batches_closed_by_time: u64,
    pub batches_closed_by_shutdown: u64,
    pub batch_size: SampleSummary,
    pub batch_latency_ms: SampleSummary,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub records_written: u64,
    pub records_store_rejected: u64,
    pub write_retries: u64,
    pub cache_writes: u64,
    pub cache_failures: u64,
    pub acks: u64,
    pub nacks: u64,
    pub ack_failures: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    /// Dead-lettered messages per received message.
    pub dead_letter_rate: f64,
    pub consumer_lag: BTreeMap<PartitionId, u64>,
    pub total_consumer_lag: u64,
    pub compaction_runs: u64,
    pub compaction_failures: u64,
    pub last_compaction: Option<CompactionJob>,
}

/// Periodically log the telemetry snapshot until cancelled.
pub async fn report_loop(
    metrics: std::sync::Arc<PipelineMetrics>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut prev_dead_lettered = 0u64;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let s = metrics.snapshot();
                let dead_letter_per_interval = s.dead_lettered - prev_dead_lettered;
                prev_dead_lettered = s.dead_lettered;
                tracing::info!(
                    target: "telemetry",
                    received = s.messages_received,
                    batches_committed = s.batches_committed,
                    batches_failed = s.batches_failed,
                    batch_size_mean = s.batch_size.mean,
                    batch_latency_p99_ms = s.batch_latency_ms.p99.unwrap_or(0),
                    write_retries = s.write_retries,
                    consumer_lag = s.total_consumer_lag,
                    dead_lettered = dead_letter_per_interval,
                    dead_letter_rate = s.dead_letter_rate,
                    "pipeline telemetry"
                );
            }
        }
    }
}
