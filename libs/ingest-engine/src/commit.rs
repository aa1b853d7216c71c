//! Writer pool: closed batches in, resolved outcomes out.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::ack::{AckCoordinator, AckSummary};
use crate::batch::{Batch, CommitOutcome};
use crate::cache_updater::{CacheUpdateSummary, CacheUpdater};
use crate::compactor::CompactionTracker;
use crate::metrics::PipelineMetrics;
use crate::writer::BatchWriter;

/// A closed batch handed to the writer pool. The partition gets the report
/// back once every message of the batch is resolved.
pub struct WorkItem {
    pub batch: Batch,
    pub reply: oneshot::Sender<BatchReport>,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub outcome: CommitOutcome,
    pub acks: AckSummary,
    pub cache: CacheUpdateSummary,
}

/// Write → cache → ack for one batch.
pub struct CommitStage {
    pub writer: BatchWriter,
    pub cache: CacheUpdater,
    pub acks: Arc<AckCoordinator>,
    pub tracker: Arc<CompactionTracker>,
    pub metrics: Arc<PipelineMetrics>,
}

impl CommitStage {
    pub async fn process(&self, item: WorkItem) {
        let WorkItem { mut batch, reply } = item;
        let outcome = self.writer.commit(&mut batch).await;

        let cache = if outcome.is_committed() {
            self.tracker.record_written(outcome.written() as u64);
            self.cache.update(&outcome, &batch).await
        } else {
            CacheUpdateSummary::default()
        };
        self.metrics
            .record_batch_resolved(outcome.is_committed(), batch.opened_at.elapsed());

        let acks = self.acks.resolve(&outcome, batch).await;
        // The partition may have been aborted during shutdown.
        let _ = reply.send(BatchReport { outcome, acks, cache });
    }
}

/// Spawn `workers` tasks sharing one queue. They exit once every sender is
/// dropped and the queue is drained.
pub fn spawn_writer_pool(
    stage: Arc<CommitStage>,
    rx: mpsc::Receiver<WorkItem>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..workers)
        .map(|worker| {
            let stage = stage.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let item = rx.lock().await.recv().await;
                    let Some(item) = item else { break };
                    stage.process(item).await;
                }
                tracing::debug!(worker, "batch writer stopped");
            })
        })
        .collect()
}
