use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use ingest_api::{PartitionId, RawMessage, ValidatedRecord};

use crate::consumer::InFlightPermit;
use crate::error::IngestFault;
use crate::validator::Validator;

/// Hex characters of the payload digest carried in the idempotency token.
const TOKEN_DIGEST_LEN: usize = 16;

/// Per-partition batch sequence number.
pub type BatchId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatchState {
    Open,
    Closing,
    Committing,
    Committed,
    Failed,
}

impl BatchState {
    fn can_become(self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Open, Closing)
                | (Closing, Committing)
                | (Committing, Committed)
                | (Committing, Failed)
        )
    }
}

/// Why a batch was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseTrigger {
    Size,
    Time,
    Shutdown,
}

/// A validated record plus what is needed to resolve its source message.
pub struct BatchEntry {
    pub record: ValidatedRecord,
    /// Kept for dead-lettering if the store rejects the record.
    pub message: RawMessage,
    /// Validator that produced the record; knows table and cache policy.
    pub validator: Arc<dyn Validator>,
    pub permit: InFlightPermit,
}

/// Ordered records of one partition, committed as one logical write.
pub struct Batch {
    pub id: BatchId,
    pub topic: String,
    pub partition: PartitionId,
    pub opened_at: Instant,
    pub closed_at: Option<Instant>,
    pub trigger: Option<CloseTrigger>,
    entries: Vec<BatchEntry>,
    state: BatchState,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("partition", &self.partition)
            .field("len", &self.entries.len())
            .field("state", &self.state)
            .field("trigger", &self.trigger)
            .finish()
    }
}

impl Batch {
    pub fn open(id: BatchId, topic: String, partition: PartitionId, now: Instant, capacity: usize) -> Self {
        Self {
            id,
            topic,
            partition,
            opened_at: now,
            closed_at: None,
            trigger: None,
            entries: Vec::with_capacity(capacity),
            state: BatchState::Open,
        }
    }

    pub fn push(&mut self, entry: BatchEntry) {
        debug_assert_eq!(self.state, BatchState::Open);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn records(&self) -> impl Iterator<Item = &ValidatedRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    /// Smallest record timestamp, used to fence compaction.
    pub fn min_ts(&self) -> Option<i64> {
        self.records().map(|r| r.ts_ms).min()
    }

    /// Deterministic token for idempotent upserts.
    ///
    /// Redelivered messages land at the same offsets with the same payloads,
    /// so a replay produces the same token. The payload digest keeps a broker
    /// that reuses offsets (a restarted in-memory topic) from colliding with
    /// an earlier, different batch.
    pub fn idempotency_token(&self) -> String {
        let first = self.entries.first().map_or(0, |e| e.message.offset);
        let last = self.entries.last().map_or(0, |e| e.message.offset);
        format!(
            "{}/{}/{first}-{last}/{}/{}",
            self.topic,
            self.partition,
            self.entries.len(),
            self.content_digest()
        )
    }

    fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for entry in &self.entries {
            hasher.update(entry.message.schema_id.as_deref().unwrap_or_default().as_bytes());
            hasher.update([0u8]);
            hasher.update((entry.message.payload.len() as u64).to_be_bytes());
            hasher.update(&entry.message.payload);
        }
        let hex = format!("{:x}", hasher.finalize());
        hex[..TOKEN_DIGEST_LEN].to_string()
    }

    pub(crate) fn close(&mut self, trigger: CloseTrigger, now: Instant) {
        self.transition(BatchState::Closing);
        self.closed_at = Some(now);
        self.trigger = Some(trigger);
    }

    pub(crate) fn transition(&mut self, next: BatchState) {
        debug_assert!(
            self.state.can_become(next),
            "invalid batch transition {:?} -> {next:?}",
            self.state
        );
        self.state = next;
    }

    /// Release the entries to the acknowledgment stage.
    pub fn into_entries(self) -> Vec<BatchEntry> {
        self.entries
    }
}

/// Terminal status of one record in a committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RecordStatus {
    Written,
    Rejected(String),
}

#[derive(Debug, Clone)]
pub enum CommitResult {
    /// One status per record, in batch order.
    Committed(Vec<RecordStatus>),
    Failed(IngestFault),
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub batch_id: BatchId,
    pub partition: PartitionId,
    pub result: CommitResult,
    pub commit_timestamp_ms: i64,
    /// Store attempts made, including the first.
    pub attempts: u32,
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self.result, CommitResult::Committed(_))
    }

    pub fn written(&self) -> usize {
        self.statuses()
            .iter()
            .filter(|s| **s == RecordStatus::Written)
            .count()
    }

    pub fn rejected(&self) -> usize {
        self.statuses()
            .iter()
            .filter(|s| matches!(s, RecordStatus::Rejected(_)))
            .count()
    }

    pub fn statuses(&self) -> &[RecordStatus] {
        match &self.result {
            CommitResult::Committed(statuses) => statuses,
            CommitResult::Failed(_) => &[],
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::SchemaConfig;
    use crate::validator::SchemaValidator;

    pub fn quote_validator(cache_fields: &[&str]) -> Arc<dyn Validator> {
        Arc::new(SchemaValidator::new(SchemaConfig {
            id: "quote".into(),
            table: "quotes".into(),
            key_field: "symbol".into(),
            ts_field: "ts_ms".into(),
            fields: vec![crate::config::FieldConfig {
                name: "bid".into(),
                field_type: crate::config::FieldType::Float,
                required: true,
                min: None,
                max: None,
            }],
            cache_fields: cache_fields.iter().map(|s| s.to_string()).collect(),
            cache_ttl_seconds: 60,
        }))
    }

    pub fn entry(validator: &Arc<dyn Validator>, offset: u64, symbol: &str, ts_ms: i64, bid: f64) -> BatchEntry {
        let message = RawMessage {
            topic: "market-data".into(),
            partition: 0,
            offset,
            delivery_attempt: 1,
            enqueue_time_ms: 0,
            schema_id: Some("quote".into()),
            payload: serde_json::to_vec(&serde_json::json!({
                "symbol": symbol, "ts_ms": ts_ms, "bid": bid
            }))
            .unwrap(),
        };
        BatchEntry {
            record: validator.validate(&message).unwrap(),
            message,
            validator: validator.clone(),
            permit: InFlightPermit::untracked(),
        }
    }

    /// A closed batch of `n` quotes with symbols `S0..S{n-1}`.
    pub fn closed_batch(n: usize, cache_fields: &[&str]) -> Batch {
        let validator = quote_validator(cache_fields);
        let mut batch = Batch::open(1, "market-data".into(), 0, Instant::now(), n);
        for i in 0..n {
            batch.push(entry(&validator, i as u64, &format!("S{i}"), 1_000 + i as i64, i as f64));
        }
        batch.close(CloseTrigger::Size, Instant::now());
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn token_is_stable_for_same_messages() {
        let a = closed_batch(3, &[]);
        let b = closed_batch(3, &[]);
        let token = a.idempotency_token();
        assert!(token.starts_with("market-data/0/0-2/3/"), "{token}");
        assert_eq!(token.len(), "market-data/0/0-2/3/".len() + TOKEN_DIGEST_LEN);
        assert_eq!(token, b.idempotency_token());
        assert_ne!(closed_batch(4, &[]).idempotency_token(), token);
    }

    #[test]
    fn reused_offsets_with_new_payloads_get_a_new_token() {
        let validator = quote_validator(&[]);
        let batch_of = |symbol: &str| {
            let mut batch = Batch::open(1, "market-data".into(), 0, Instant::now(), 3);
            for i in 0..3u64 {
                batch.push(entry(&validator, i, &format!("{symbol}{i}"), 1_000, 1.0));
            }
            batch.close(CloseTrigger::Size, Instant::now());
            batch
        };

        let before_restart = batch_of("A");
        let after_restart = batch_of("B");
        assert_eq!(before_restart.entries()[0].message.offset, after_restart.entries()[0].message.offset);
        assert_ne!(before_restart.idempotency_token(), after_restart.idempotency_token());
        assert_eq!(before_restart.idempotency_token(), batch_of("A").idempotency_token());
    }

    #[test]
    fn lifecycle_transitions() {
        let mut batch = closed_batch(2, &[]);
        assert_eq!(batch.state(), BatchState::Closing);
        assert_eq!(batch.trigger, Some(CloseTrigger::Size));
        batch.transition(BatchState::Committing);
        batch.transition(BatchState::Committed);
        assert_eq!(batch.state(), BatchState::Committed);
        assert_eq!(batch.min_ts(), Some(1_000));
    }

    #[test]
    #[should_panic(expected = "invalid batch transition")]
    fn cannot_skip_committing() {
        let mut batch = closed_batch(1, &[]);
        batch.transition(BatchState::Committed);
    }

    #[test]
    fn outcome_counts() {
        let outcome = CommitOutcome {
            batch_id: 1,
            partition: 0,
            result: CommitResult::Committed(vec![
                RecordStatus::Written,
                RecordStatus::Rejected("constraint".into()),
                RecordStatus::Written,
            ]),
            commit_timestamp_ms: 0,
            attempts: 1,
        };
        assert!(outcome.is_committed());
        assert_eq!(outcome.written(), 2);
        assert_eq!(outcome.rejected(), 1);
    }
}
