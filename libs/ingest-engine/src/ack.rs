use std::sync::Arc;
use std::sync::atomic::Ordering;

use ingest_api::broker::BrokerClient;
use ingest_api::dead_letter::DeadLetterSink;
use ingest_api::{MessageRef, RawMessage};

use crate::batch::{Batch, CommitOutcome, CommitResult, RecordStatus};
use crate::consumer::InFlightPermit;
use crate::dead_letter::DeadLetterReason;
use crate::metrics::PipelineMetrics;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckSummary {
    pub acked: usize,
    pub nacked: usize,
    pub dead_lettered: usize,
}

/// Resolves source messages once their outcome is known.
///
/// Written and rejected records are acked (rejected ones after a successful
/// dead-letter append). Every message of a failed batch is nacked so the
/// broker redelivers it. In-flight permits are released as messages resolve.
pub struct AckCoordinator {
    broker: Arc<dyn BrokerClient>,
    dead_letter: Arc<dyn DeadLetterSink>,
    metrics: Arc<PipelineMetrics>,
}

impl AckCoordinator {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        dead_letter: Arc<dyn DeadLetterSink>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            broker,
            dead_letter,
            metrics,
        }
    }

    /// Dead-letter a message that failed validation, then ack it.
    pub async fn reject_invalid(
        &self,
        message: RawMessage,
        reason: DeadLetterReason,
        permit: InFlightPermit,
    ) -> AckSummary {
        let mut summary = AckSummary::default();
        self.dead_letter_then_ack(&message, &reason, &mut summary).await;
        drop(permit);
        summary
    }

    /// Resolve every message of a batch according to its outcome.
    pub async fn resolve(&self, outcome: &CommitOutcome, batch: Batch) -> AckSummary {
        let mut summary = AckSummary::default();
        let entries = batch.into_entries();

        match &outcome.result {
            CommitResult::Committed(statuses) => {
                for (entry, status) in entries.into_iter().zip(statuses) {
                    match status {
                        RecordStatus::Written => self.ack(&entry.record.source, &mut summary).await,
                        RecordStatus::Rejected(reason) => {
                            let reason = DeadLetterReason::StoreRejected(reason.clone());
                            self.dead_letter_then_ack(&entry.message, &reason, &mut summary).await;
                        }
                    }
                    drop(entry.permit);
                }
            }
            CommitResult::Failed(fault) => {
                tracing::warn!(
                    partition = outcome.partition,
                    batch_id = outcome.batch_id,
                    messages = entries.len(),
                    error = %fault,
                    "nacking failed batch"
                );
                for entry in entries {
                    self.nack(&entry.record.source, &mut summary).await;
                    drop(entry.permit);
                }
            }
        }
        summary
    }

    async fn dead_letter_then_ack(
        &self,
        message: &RawMessage,
        reason: &DeadLetterReason,
        summary: &mut AckSummary,
    ) {
        match self.dead_letter.append(reason.entry_for(message)).await {
            Ok(()) => {
                summary.dead_lettered += 1;
                self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    partition = message.partition,
                    offset = message.offset,
                    reason = %reason,
                    "message dead-lettered"
                );
                self.ack(&message.message_ref(), summary).await;
            }
            Err(e) => {
                // Not recorded anywhere yet: hand it back to the broker.
                self.metrics.dead_letter_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "dead-letter append failed, nacking instead"
                );
                self.nack(&message.message_ref(), summary).await;
            }
        }
    }

    async fn ack(&self, msg: &MessageRef, summary: &mut AckSummary) {
        match self.broker.ack(msg).await {
            Ok(()) => {
                summary.acked += 1;
                self.metrics.acks.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // The broker will redeliver after its deadline; the upsert absorbs the replay.
                self.metrics.ack_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(partition = msg.partition, offset = msg.offset, error = %e, "ack failed");
            }
        }
    }

    async fn nack(&self, msg: &MessageRef, summary: &mut AckSummary) {
        match self.broker.nack(msg).await {
            Ok(()) => {
                summary.nacked += 1;
                self.metrics.nacks.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.metrics.ack_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(partition = msg.partition, offset = msg.offset, error = %e, "nack failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchState;
    use crate::batch::test_support::closed_batch;
    use crate::dead_letter::MemoryDeadLetterSink;
    use crate::error::IngestFault;
    use crate::validator::RejectionReason;
    use broker_memory::MemoryBroker;
    use ingest_api::broker::SubscriptionHandle;
    use std::time::Duration;

    struct Harness {
        broker: Arc<MemoryBroker>,
        handle: SubscriptionHandle,
        dlq: Arc<MemoryDeadLetterSink>,
        acks: AckCoordinator,
    }

    /// Broker with `n` delivered (in-flight) messages at offsets 0..n.
    async fn harness(n: usize) -> Harness {
        let broker = Arc::new(MemoryBroker::default());
        for _ in 0..n {
            broker.append("market-data", 0, Some("quote".into()), Vec::new());
        }
        let handle = broker.subscribe("market-data", 0).await.unwrap();
        for _ in 0..n {
            broker.receive(&handle, Duration::from_millis(10)).await.unwrap().unwrap();
        }
        let dlq = Arc::new(MemoryDeadLetterSink::new());
        let acks = AckCoordinator::new(broker.clone(), dlq.clone(), Arc::new(PipelineMetrics::new()));
        Harness { broker, handle, dlq, acks }
    }

    fn outcome(result: CommitResult) -> CommitOutcome {
        CommitOutcome {
            batch_id: 1,
            partition: 0,
            result,
            commit_timestamp_ms: 0,
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn acks_written_and_dead_letters_rejected() {
        let h = harness(100).await;
        let mut batch = closed_batch(100, &[]);
        batch.transition(BatchState::Committing);
        batch.transition(BatchState::Committed);

        let mut statuses = vec![RecordStatus::Written; 100];
        statuses[6] = RecordStatus::Rejected("check constraint".into());
        let summary = h.acks.resolve(&outcome(CommitResult::Committed(statuses)), batch).await;

        assert_eq!(summary, AckSummary { acked: 100, nacked: 0, dead_lettered: 1 });
        assert_eq!(h.broker.lag(&h.handle).await.unwrap(), 0);
        let dlq = h.dlq.entries();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].offset, 6);
        assert_eq!(dlq[0].reason_kind, "store_rejected");
    }

    #[tokio::test]
    async fn failed_batch_is_nacked() {
        let h = harness(100).await;
        let batch = closed_batch(100, &[]);
        let fault = IngestFault::BatchFailed {
            batch_id: 1,
            attempts: 4,
            reason: "store unavailable".into(),
        };
        let summary = h.acks.resolve(&outcome(CommitResult::Failed(fault)), batch).await;

        assert_eq!(summary, AckSummary { acked: 0, nacked: 100, dead_lettered: 0 });
        assert_eq!(h.broker.lag(&h.handle).await.unwrap(), 100);
        assert!(h.dlq.entries().is_empty());
    }

    #[tokio::test]
    async fn invalid_message_is_dead_lettered_and_acked() {
        let h = harness(1).await;
        let message = RawMessage {
            topic: "market-data".into(),
            partition: 0,
            offset: 0,
            delivery_attempt: 1,
            enqueue_time_ms: 0,
            schema_id: None,
            payload: b"garbage".to_vec(),
        };
        let reason = DeadLetterReason::from(RejectionReason::UnknownSchema("<none>".into()));
        let summary = h
            .acks
            .reject_invalid(message, reason, InFlightPermit::untracked())
            .await;
        assert_eq!(summary.acked, 1);
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(h.dlq.entries()[0].reason_kind, "unknown_schema");
        assert_eq!(h.broker.lag(&h.handle).await.unwrap(), 0);
    }
}
