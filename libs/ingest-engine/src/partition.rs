use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ingest_api::PartitionId;

use crate::ack::AckCoordinator;
use crate::batch::{Batch, BatchEntry};
use crate::batcher::Batcher;
use crate::commit::{BatchReport, WorkItem};
use crate::compactor::CompactionFence;
use crate::consumer::{Delivery, PartitionConsumer};
use crate::metrics::PipelineMetrics;
use crate::validator::RegistryHandle;

const BROKER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

struct InCommit {
    reply: oneshot::Receiver<BatchReport>,
    min_ts: Option<i64>,
}

enum Event {
    Stop,
    Resolved(Result<BatchReport, oneshot::error::RecvError>),
    Deadline,
    Delivered(Result<Option<Delivery>, ingest_api::ClientError>),
}

/// Consumer → validator → batcher for one partition.
///
/// Closed batches queue up locally and are handed to the writer pool one at
/// a time: the next batch is submitted only after the previous one has been
/// fully resolved, so commits and acks follow close order.
pub struct PartitionWorker {
    consumer: PartitionConsumer,
    batcher: Batcher,
    registry: Arc<RegistryHandle>,
    acks: Arc<AckCoordinator>,
    work_tx: mpsc::Sender<WorkItem>,
    fence: Arc<CompactionFence>,
    metrics: Arc<PipelineMetrics>,
    stop: CancellationToken,
    ready: VecDeque<Batch>,
    in_commit: Option<InCommit>,
    stopping: bool,
}

impl PartitionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: PartitionConsumer,
        batcher: Batcher,
        registry: Arc<RegistryHandle>,
        acks: Arc<AckCoordinator>,
        work_tx: mpsc::Sender<WorkItem>,
        fence: Arc<CompactionFence>,
        metrics: Arc<PipelineMetrics>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            consumer,
            batcher,
            registry,
            acks,
            work_tx,
            fence,
            metrics,
            stop,
            ready: VecDeque::new(),
            in_commit: None,
            stopping: false,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.consumer.partition()
    }

    /// Run until stopped and every closed batch has been resolved.
    pub async fn run(mut self) {
        let partition = self.partition();
        tracing::info!(partition, "partition worker started");
        self.refresh_lag().await;

        loop {
            self.submit_next().await;
            self.publish_fence();
            if self.stopping && self.in_commit.is_none() && self.ready.is_empty() {
                break;
            }

            let deadline = self.batcher.deadline();
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled(), if !self.stopping => Event::Stop,
                report = wait_reply(self.in_commit.as_mut()) => Event::Resolved(report),
                _ = sleep_until_opt(deadline), if !self.stopping => Event::Deadline,
                delivery = self.consumer.poll(), if !self.stopping => Event::Delivered(delivery),
            };

            match event {
                Event::Stop => {
                    self.stopping = true;
                    if let Some(batch) = self.batcher.force_close(Instant::now()) {
                        self.enqueue(batch);
                    }
                    tracing::info!(
                        partition,
                        pending_batches = self.ready.len() + self.in_commit.is_some() as usize,
                        "partition stopping, draining batches"
                    );
                }
                Event::Resolved(Ok(report)) => {
                    self.in_commit = None;
                    tracing::debug!(
                        partition,
                        batch_id = report.outcome.batch_id,
                        committed = report.outcome.is_committed(),
                        acked = report.acks.acked,
                        nacked = report.acks.nacked,
                        "batch resolved"
                    );
                    self.refresh_lag().await;
                }
                Event::Resolved(Err(_)) => {
                    self.in_commit = None;
                    self.writers_gone();
                }
                Event::Deadline => {
                    if let Some(batch) = self.batcher.poll_expired(Instant::now()) {
                        self.enqueue(batch);
                    }
                }
                Event::Delivered(Ok(Some(delivery))) => self.admit(delivery).await,
                Event::Delivered(Ok(None)) => {}
                Event::Delivered(Err(e)) => {
                    tracing::warn!(partition, error = %e, "broker receive failed");
                    tokio::time::sleep(BROKER_ERROR_BACKOFF).await;
                }
            }
        }

        self.fence.set(partition, None);
        tracing::info!(partition, "partition worker stopped");
    }

    /// Validate a delivery and add it to the open batch, or dead-letter it.
    async fn admit(&mut self, delivery: Delivery) {
        let now = Instant::now();
        // The time trigger wins over a record arriving at the deadline.
        if let Some(batch) = self.batcher.poll_expired(now) {
            self.enqueue(batch);
        }

        let Delivery { message, permit } = delivery;
        let registry = self.registry.snapshot();
        let validated = registry
            .resolve(&message)
            .and_then(|validator| validator.validate(&message).map(|record| (validator, record)));

        match validated {
            Ok((validator, record)) => {
                self.metrics.records_validated.fetch_add(1, Ordering::Relaxed);
                let entry = BatchEntry {
                    record,
                    message,
                    validator,
                    permit,
                };
                if let Some(batch) = self.batcher.offer(entry, now) {
                    self.enqueue(batch);
                }
            }
            Err(reason) => {
                self.metrics.validation_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    partition = message.partition,
                    offset = message.offset,
                    reason = %reason,
                    "message rejected by validation"
                );
                self.acks.reject_invalid(message, reason.into(), permit).await;
            }
        }
    }

    fn enqueue(&mut self, batch: Batch) {
        if let Some(trigger) = batch.trigger {
            self.metrics.record_batch_closed(trigger, batch.len());
        }
        self.ready.push_back(batch);
    }

    async fn submit_next(&mut self) {
        if self.in_commit.is_some() {
            return;
        }
        let Some(batch) = self.ready.pop_front() else {
            return;
        };
        let min_ts = batch.min_ts();
        let (reply_tx, reply_rx) = oneshot::channel();
        match self.work_tx.send(WorkItem { batch, reply: reply_tx }).await {
            Ok(()) => {
                self.in_commit = Some(InCommit {
                    reply: reply_rx,
                    min_ts,
                });
            }
            Err(_) => self.writers_gone(),
        }
    }

    /// Writer pool is gone; nothing else can be committed. Dropping the
    /// batches releases their permits and the broker redelivers.
    fn writers_gone(&mut self) {
        tracing::error!(
            partition = self.partition(),
            abandoned_batches = self.ready.len(),
            "writer pool closed, abandoning batches"
        );
        self.ready.clear();
        self.stopping = true;
    }

    fn publish_fence(&self) {
        let min_ts = self
            .batcher
            .open_min_ts()
            .into_iter()
            .chain(self.ready.iter().filter_map(Batch::min_ts))
            .chain(self.in_commit.as_ref().and_then(|c| c.min_ts))
            .min();
        self.fence.set(self.partition(), min_ts);
    }

    async fn refresh_lag(&self) {
        match self.consumer.lag().await {
            Ok(lag) => self.metrics.set_lag(self.partition(), lag),
            Err(e) => tracing::debug!(partition = self.partition(), error = %e, "lag unavailable"),
        }
    }
}

async fn wait_reply(
    in_commit: Option<&mut InCommit>,
) -> Result<BatchReport, oneshot::error::RecvError> {
    match in_commit {
        Some(c) => (&mut c.reply).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
