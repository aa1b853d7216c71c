use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ingest_api::PartitionId;
use ingest_api::store::{AnalyticalStore, CompactionRange, CompactionStats};

use crate::error::IngestFault;
use crate::metrics::PipelineMetrics;
use crate::validator::RegistryHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionTrigger {
    /// Uncompacted record count crossed the threshold.
    Volume,
    Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactorState {
    Idle,
    Running,
}

/// One compaction run over every known table.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionJob {
    pub tables: Vec<String>,
    pub range: CompactionRange,
    pub trigger: CompactionTrigger,
    pub started_at_ms: i64,
    pub completed_at_ms: i64,
    /// First table failure, if any.
    pub failure: Option<String>,
    pub stats: CompactionStats,
}

// ---------------------------------------------------------------------------
// Fence
// ---------------------------------------------------------------------------

/// Oldest record timestamp still owned by an open, ready or committing batch,
/// per partition. Compaction never touches data at or after the floor.
#[derive(Debug, Default)]
pub struct CompactionFence {
    partitions: Mutex<HashMap<PartitionId, Option<i64>>>,
}

impl CompactionFence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, partition: PartitionId, min_ts: Option<i64>) {
        self.partitions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(partition, min_ts);
    }

    /// Lowest fenced timestamp across partitions; `None` when nothing is pending.
    pub fn floor(&self) -> Option<i64> {
        self.partitions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .flatten()
            .copied()
            .min()
    }
}

// ---------------------------------------------------------------------------
// Volume tracker
// ---------------------------------------------------------------------------

/// Counts records written since the last compaction and wakes the compactor
/// once the count exceeds the threshold.
#[derive(Debug)]
pub struct CompactionTracker {
    uncompacted: AtomicU64,
    threshold: u64,
    notify: Notify,
}

impl CompactionTracker {
    pub fn new(threshold: u64) -> Self {
        Self {
            uncompacted: AtomicU64::new(0),
            threshold,
            notify: Notify::new(),
        }
    }

    pub fn record_written(&self, n: u64) {
        let total = self.uncompacted.fetch_add(n, Ordering::Relaxed) + n;
        if total > self.threshold {
            self.notify.notify_one();
        }
    }

    pub fn pending(&self) -> u64 {
        self.uncompacted.load(Ordering::Relaxed)
    }

    pub fn over_threshold(&self) -> bool {
        self.pending() > self.threshold
    }

    fn take(&self) -> u64 {
        self.uncompacted.swap(0, Ordering::Relaxed)
    }

    fn restore(&self, n: u64) {
        self.uncompacted.fetch_add(n, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Compactor
// ---------------------------------------------------------------------------

/// Background merge of superseded row versions in closed ranges.
pub struct Compactor {
    store: Arc<dyn AnalyticalStore>,
    registry: Arc<RegistryHandle>,
    fence: Arc<CompactionFence>,
    tracker: Arc<CompactionTracker>,
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
    running: AtomicBool,
}

impl Compactor {
    pub fn new(
        store: Arc<dyn AnalyticalStore>,
        registry: Arc<RegistryHandle>,
        fence: Arc<CompactionFence>,
        tracker: Arc<CompactionTracker>,
        metrics: Arc<PipelineMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            fence,
            tracker,
            metrics,
            interval,
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CompactorState {
        if self.running.load(Ordering::Relaxed) {
            CompactorState::Running
        } else {
            CompactorState::Idle
        }
    }

    /// Run until cancelled.
    ///
    /// A failed run disarms the volume trigger; the next attempt waits for the
    /// schedule.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut next_schedule = Instant::now() + self.interval;
        let mut volume_armed = true;
        tracing::info!(interval_s = self.interval.as_secs(), "compactor started");

        loop {
            let trigger = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep_until(next_schedule) => CompactionTrigger::Schedule,
                _ = self.tracker.notify.notified(), if volume_armed => CompactionTrigger::Volume,
            };

            match trigger {
                CompactionTrigger::Schedule => {
                    next_schedule = Instant::now() + self.interval;
                    volume_armed = true;
                }
                // Stale wakeup from before the last run.
                CompactionTrigger::Volume if !self.tracker.over_threshold() => continue,
                CompactionTrigger::Volume => {}
            }

            let job = self.run_once(trigger).await;
            if job.failure.is_some() {
                volume_armed = false;
            }
        }
        tracing::info!("compactor stopped");
    }

    /// Compact every registered table up to the fence.
    pub async fn run_once(&self, trigger: CompactionTrigger) -> CompactionJob {
        self.running.store(true, Ordering::Relaxed);
        let started_at_ms = ingest_api::now_ms();
        let consumed = self.tracker.take();
        let range = CompactionRange {
            before_ts_ms: self.fence.floor().map_or(started_at_ms, |f| f.min(started_at_ms)),
        };
        let tables: Vec<String> = self.registry.snapshot().tables().into_iter().collect();
        tracing::debug!(?trigger, before_ts_ms = range.before_ts_ms, tables = tables.len(), "compaction started");

        let mut stats = CompactionStats::default();
        let mut failure = None;
        for table in &tables {
            match self.store.compact(table, range).await {
                Ok(s) => {
                    stats.rows_merged += s.rows_merged;
                    stats.rows_pruned += s.rows_pruned;
                }
                Err(source) => {
                    let fault = IngestFault::CompactionFailure {
                        table: table.clone(),
                        source,
                    };
                    tracing::warn!(error = %fault, "compaction failed, retrying on next schedule");
                    failure.get_or_insert_with(|| fault.to_string());
                }
            }
        }
        if failure.is_some() {
            self.tracker.restore(consumed);
        }

        let job = CompactionJob {
            tables,
            range,
            trigger,
            started_at_ms,
            completed_at_ms: ingest_api::now_ms(),
            failure,
            stats,
        };
        if job.failure.is_none() {
            tracing::info!(
                ?trigger,
                rows_merged = stats.rows_merged,
                rows_pruned = stats.rows_pruned,
                "compaction finished"
            );
        }
        self.metrics.record_compaction(job.clone());
        self.running.store(false, Ordering::Relaxed);
        job
    }
}
