use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

use crate::error::ClientError;
use crate::record::ValidatedRecord;

/// Per-record result of [`AnalyticalStore::batch_upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertStatus {
    /// Row inserted or overwritten.
    Written,
    /// Identical row already present, or the token was already committed.
    Unchanged,
    /// The store refused this row (constraint violation). Not retryable.
    Rejected(String),
}

impl UpsertStatus {
    pub fn is_written(&self) -> bool {
        !matches!(self, UpsertStatus::Rejected(_))
    }
}

/// Closed historical range a compaction run may touch.
///
/// Everything strictly older than `before_ts_ms` is no longer written to by
/// any open or committing batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionRange {
    pub before_ts_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    /// Superseded row versions folded away.
    pub rows_merged: u64,
    /// Rows dropped by retention.
    pub rows_pruned: u64,
}

/// Columnar analytical store with upsert-by-key semantics.
///
/// Rows are keyed by `(natural_key, ts_ms)` within a table. Repeating an
/// upsert with an already committed idempotency token must leave the store
/// unchanged.
pub trait AnalyticalStore: Send + Sync {
    /// Create the table if it does not exist. Called once per table at startup.
    fn ensure_table<'a>(
        &'a self,
        table: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>>;

    /// Upsert all records as one logical write.
    ///
    /// `Err` means nothing can be assumed about the write and the caller
    /// should retry the whole call. `Ok` holds one status per input record,
    /// in input order.
    fn batch_upsert<'a>(
        &'a self,
        table: &'a str,
        records: &'a [ValidatedRecord],
        idempotency_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<UpsertStatus>, ClientError>> + Send + 'a>>;

    fn compact<'a>(
        &'a self,
        table: &'a str,
        range: CompactionRange,
    ) -> Pin<Box<dyn Future<Output = Result<CompactionStats, ClientError>> + Send + 'a>>;
}
