use std::time::Duration;

use tokio::time::Instant;

use ingest_api::PartitionId;

use crate::batch::{Batch, BatchEntry, BatchId, CloseTrigger};

/// Accumulates records of one partition into size/time bounded batches.
///
/// Time is passed in by the caller; the owning task sleeps until
/// [`Batcher::deadline`] and then calls [`Batcher::poll_expired`].
#[derive(Debug)]
pub struct Batcher {
    topic: String,
    partition: PartitionId,
    max_size: usize,
    max_wait: Duration,
    open: Option<Batch>,
    next_id: BatchId,
}

impl Batcher {
    pub fn new(topic: String, partition: PartitionId, max_size: usize, max_wait: Duration) -> Self {
        Self {
            topic,
            partition,
            max_size: max_size.max(1),
            max_wait,
            open: None,
            next_id: 1,
        }
    }

    /// Append a record to the open batch, opening one if needed.
    ///
    /// Returns the batch when this record filled it to `max_size`.
    pub fn offer(&mut self, entry: BatchEntry, now: Instant) -> Option<Batch> {
        let batch = self.open.get_or_insert_with(|| {
            let id = self.next_id;
            self.next_id += 1;
            Batch::open(id, self.topic.clone(), self.partition, now, self.max_size)
        });
        batch.push(entry);
        if batch.len() >= self.max_size {
            return self.close(CloseTrigger::Size, now);
        }
        None
    }

    /// When the open batch reaches `max_wait`, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.open.as_ref().map(|b| b.opened_at + self.max_wait)
    }

    /// Close the open batch if it has been open for `max_wait` or longer.
    pub fn poll_expired(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.close(CloseTrigger::Time, now),
            _ => None,
        }
    }

    /// Close whatever is open, regardless of size or age.
    pub fn force_close(&mut self, now: Instant) -> Option<Batch> {
        self.close(CloseTrigger::Shutdown, now)
    }

    pub fn open_len(&self) -> usize {
        self.open.as_ref().map_or(0, Batch::len)
    }

    pub fn open_min_ts(&self) -> Option<i64> {
        self.open.as_ref().and_then(Batch::min_ts)
    }

    fn close(&mut self, trigger: CloseTrigger, now: Instant) -> Option<Batch> {
        let mut batch = self.open.take()?;
        batch.close(trigger, now);
        tracing::debug!(
            partition = self.partition,
            batch_id = batch.id,
            size = batch.len(),
            ?trigger,
            "batch closed"
        );
        Some(batch)
    }
}
