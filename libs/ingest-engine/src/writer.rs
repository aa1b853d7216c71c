use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::Instant;

use ingest_api::store::{AnalyticalStore, UpsertStatus};
use ingest_api::{ClientError, ValidatedRecord};

use crate::batch::{Batch, BatchState, CommitOutcome, CommitResult, RecordStatus};
use crate::error::IngestFault;
use crate::health::HealthMonitor;
use crate::metrics::PipelineMetrics;
use crate::retry::{RetryDecision, RetryPolicy, RetryState};

/// Records of one batch that go to the same table.
struct TableGroup {
    table: String,
    /// Positions of the records in the batch.
    positions: Vec<usize>,
    records: Vec<ValidatedRecord>,
    /// Set once the store accepted the group.
    statuses: Option<Vec<UpsertStatus>>,
}

/// Commits closed batches to the analytical store.
///
/// A batch is upserted per target table under a token derived from the
/// batch's offsets and payloads, so a replay after a crash or a nack is
/// absorbed by the store. Transient failures are retried with exponential
/// backoff. A permanent failure fails the batch at once and marks the
/// pipeline fatal, since redelivery cannot fix it. The batch is `Committed`
/// only once every table accepted its records.
pub struct BatchWriter {
    store: Arc<dyn AnalyticalStore>,
    policy: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthMonitor>,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn AnalyticalStore>,
        policy: RetryPolicy,
        metrics: Arc<PipelineMetrics>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            store,
            policy,
            metrics,
            health,
        }
    }

    pub async fn commit(&self, batch: &mut Batch) -> CommitOutcome {
        batch.transition(BatchState::Committing);
        let token = batch.idempotency_token();
        let mut groups = group_by_table(batch);
        let mut retry = RetryState::new();

        let result = loop {
            retry.begin_attempt();
            match self.attempt(&mut groups, &token).await {
                Ok(()) => {
                    self.health.record_store_success();
                    break CommitResult::Committed(merge_statuses(batch.len(), groups));
                }
                Err((table, source)) => {
                    let now = Instant::now();
                    self.health.record_store_failure(now);
                    if !source.is_transient() {
                        self.health.set_fatal(format!("analytical store rejected writes to '{table}': {source}"));
                    }
                    let fault = IngestFault::TransientWriteFailure {
                        table,
                        attempt: retry.attempt,
                        source: source.clone(),
                    };

                    let decision = if source.is_transient() {
                        retry.on_failure(&self.policy, now)
                    } else {
                        RetryDecision::GiveUp
                    };
                    match decision {
                        RetryDecision::RetryAt(at) => {
                            self.metrics.write_retries.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                partition = batch.partition,
                                batch_id = batch.id,
                                retry_in_ms = at.saturating_duration_since(now).as_millis() as u64,
                                error = %fault,
                                "batch write failed, retrying"
                            );
                            tokio::time::sleep_until(at).await;
                        }
                        RetryDecision::GiveUp => {
                            tracing::error!(
                                partition = batch.partition,
                                batch_id = batch.id,
                                records = batch.len(),
                                error = %fault,
                                "giving up on batch"
                            );
                            break CommitResult::Failed(IngestFault::BatchFailed {
                                batch_id: batch.id,
                                attempts: retry.attempt,
                                reason: source.to_string(),
                            });
                        }
                    }
                }
            }
        };

        let outcome = CommitOutcome {
            batch_id: batch.id,
            partition: batch.partition,
            result,
            commit_timestamp_ms: ingest_api::now_ms(),
            attempts: retry.attempt,
        };

        if outcome.is_committed() {
            batch.transition(BatchState::Committed);
            let written = outcome.written() as u64;
            let rejected = outcome.rejected() as u64;
            self.metrics.records_written.fetch_add(written, Ordering::Relaxed);
            self.metrics.records_store_rejected.fetch_add(rejected, Ordering::Relaxed);
            tracing::debug!(
                partition = batch.partition,
                batch_id = batch.id,
                written,
                rejected,
                attempts = outcome.attempts,
                "batch committed"
            );
        } else {
            batch.transition(BatchState::Failed);
        }
        outcome
    }

    /// Upsert every group that has not been accepted yet.
    async fn attempt(&self, groups: &mut [TableGroup], token: &str) -> Result<(), (String, ClientError)> {
        for group in groups.iter_mut().filter(|g| g.statuses.is_none()) {
            let group_token = format!("{token}/{}", group.table);
            let statuses = self
                .store
                .batch_upsert(&group.table, &group.records, &group_token)
                .await
                .map_err(|e| (group.table.clone(), e))?;
            if statuses.len() != group.records.len() {
                return Err((
                    group.table.clone(),
                    ClientError::logic(format!(
                        "store returned {} statuses for {} records",
                        statuses.len(),
                        group.records.len()
                    )),
                ));
            }
            group.statuses = Some(statuses);
        }
        Ok(())
    }
}

fn group_by_table(batch: &Batch) -> Vec<TableGroup> {
    let mut groups: Vec<TableGroup> = Vec::new();
    for (pos, entry) in batch.entries().iter().enumerate() {
        let table = entry.validator.table();
        let idx = match groups.iter().position(|g| g.table == table) {
            Some(i) => i,
            None => {
                groups.push(TableGroup {
                    table: table.to_string(),
                    positions: Vec::new(),
                    records: Vec::new(),
                    statuses: None,
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[idx];
        group.positions.push(pos);
        group.records.push(entry.record.clone());
    }
    groups
}

fn merge_statuses(len: usize, groups: Vec<TableGroup>) -> Vec<RecordStatus> {
    let mut out = vec![RecordStatus::Written; len];
    for group in groups {
        for (pos, status) in group.positions.into_iter().zip(group.statuses.unwrap_or_default()) {
            if let UpsertStatus::Rejected(reason) = status {
                out[pos] = RecordStatus::Rejected(reason);
            }
        }
    }
    out
}
