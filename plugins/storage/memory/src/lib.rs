use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use ingest_api::store::{AnalyticalStore, CompactionRange, CompactionStats, UpsertStatus};
use ingest_api::{ClientError, ValidatedRecord};

type Fields = serde_json::Map<String, serde_json::Value>;
type RowKey = (String, i64);
type RejectFn = dyn Fn(&ValidatedRecord) -> Option<String> + Send + Sync;

// ═══════════════════════════════════════════════════════════════
//  MemoryStoreConfig
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, serde::Deserialize)]
pub struct MemoryStoreConfig {
    /// Rows older than this (relative to now) are pruned by compaction.
    #[serde(default)]
    pub retention_hours: Option<u64>,
    /// How many recent idempotency tokens each table remembers.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
}

fn default_dedup_window() -> usize { 1_000 }

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            retention_hours: None,
            dedup_window: default_dedup_window(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Table state
// ═══════════════════════════════════════════════════════════════

/// Outcomes of the last `capacity` committed idempotency tokens.
/// The oldest token is forgotten first.
struct TokenWindow {
    outcomes: HashMap<String, Vec<UpsertStatus>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl TokenWindow {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, token: &str) -> Option<&Vec<UpsertStatus>> {
        self.outcomes.get(token)
    }

    fn insert(&mut self, token: &str, statuses: Vec<UpsertStatus>) {
        if self.capacity == 0 {
            return;
        }
        if self.outcomes.insert(token.to_string(), statuses).is_none() {
            self.order.push_back(token.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.outcomes.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }
}

struct Table {
    /// Resolved view: latest value per `(natural_key, ts_ms)`.
    rows: HashMap<RowKey, Fields>,
    /// Row versions written since the last compaction, in write order.
    delta: Vec<RowKey>,
    tokens: TokenWindow,
}

impl Table {
    fn new(dedup_window: usize) -> Self {
        Self {
            rows: HashMap::new(),
            delta: Vec::new(),
            tokens: TokenWindow::new(dedup_window),
        }
    }

    fn upsert(&mut self, records: &[ValidatedRecord], reject: Option<&RejectFn>) -> Vec<UpsertStatus> {
        records
            .iter()
            .map(|record| {
                if record.natural_key.is_empty() {
                    return UpsertStatus::Rejected("empty natural key".into());
                }
                if let Some(reason) = reject.and_then(|f| f(record)) {
                    return UpsertStatus::Rejected(reason);
                }
                let key = (record.natural_key.clone(), record.ts_ms);
                if self.rows.get(&key) == Some(&record.fields) {
                    return UpsertStatus::Unchanged;
                }
                self.rows.insert(key.clone(), record.fields.clone());
                self.delta.push(key);
                UpsertStatus::Written
            })
            .collect()
    }

    fn compact(&mut self, range: CompactionRange, prune_before: Option<i64>) -> CompactionStats {
        let mut stats = CompactionStats::default();

        let (closed, open): (Vec<RowKey>, Vec<RowKey>) = self
            .delta
            .drain(..)
            .partition(|(_, ts)| *ts < range.before_ts_ms);
        self.delta = open;

        let mut seen = std::collections::HashSet::with_capacity(closed.len());
        for key in closed {
            if !seen.insert(key) {
                stats.rows_merged += 1;
            }
        }

        if let Some(cutoff) = prune_before {
            let cutoff = cutoff.min(range.before_ts_ms);
            let before = self.rows.len();
            self.rows.retain(|(_, ts), _| *ts >= cutoff);
            stats.rows_pruned = (before - self.rows.len()) as u64;
        }
        stats
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryStore
// ═══════════════════════════════════════════════════════════════

/// In-memory upsert store. Used for development runs and as the test double
/// for the analytical store, hence the fault-injection hooks.
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
    retention_ms: Option<i64>,
    dedup_window: usize,
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    fail_compaction: AtomicBool,
    reject: Mutex<Option<Box<RejectFn>>>,
    upsert_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            retention_ms: config.retention_hours.map(|h| h as i64 * 3_600_000),
            dedup_window: config.dedup_window,
            unavailable: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            fail_compaction: AtomicBool::new(false),
            reject: Mutex::new(None),
            upsert_calls: AtomicU64::new(0),
        }
    }

    /// Build from the `[store]` section options.
    pub fn from_options(options: &serde_json::Value) -> Result<Self, ClientError> {
        let config: MemoryStoreConfig = serde_json::from_value(options.clone())
            .map_err(|e| ClientError::config(format!("memory store config: {e}")))?;
        Ok(Self::new(config))
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Fault injection ──

    /// While set, every upsert fails with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` upsert calls with a transient error.
    pub fn fail_next_upserts(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_compaction_failing(&self, failing: bool) {
        self.fail_compaction.store(failing, Ordering::SeqCst);
    }

    /// Reject records for which `f` returns a reason, as a constraint
    /// violation would.
    pub fn reject_when<F>(&self, f: F)
    where
        F: Fn(&ValidatedRecord) -> Option<String> + Send + Sync + 'static,
    {
        *self.reject.lock().unwrap_or_else(|p| p.into_inner()) = Some(Box::new(f));
    }

    // ── Inspection ──

    pub fn get(&self, table: &str, natural_key: &str, ts_ms: i64) -> Option<Fields> {
        self.tables()
            .get(table)
            .and_then(|t| t.rows.get(&(natural_key.to_string(), ts_ms)).cloned())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables().get(table).map_or(0, |t| t.rows.len())
    }

    /// Row versions not yet folded by compaction.
    pub fn uncompacted(&self, table: &str) -> usize {
        self.tables().get(table).map_or(0, |t| t.delta.len())
    }

    pub fn committed_tokens(&self, table: &str) -> usize {
        self.tables().get(table).map_or(0, |t| t.tokens.len())
    }

    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> Option<ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Some(ClientError::io("memory store unavailable"));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        consumed.then(|| ClientError::io("injected write failure"))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl AnalyticalStore for MemoryStore {
    fn ensure_table<'a>(
        &'a self,
        table: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>> {
        Box::pin(async move {
            self.tables()
                .entry(table.to_string())
                .or_insert_with(|| Table::new(self.dedup_window));
            Ok(())
        })
    }

    fn batch_upsert<'a>(
        &'a self,
        table: &'a str,
        records: &'a [ValidatedRecord],
        idempotency_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<UpsertStatus>, ClientError>> + Send + 'a>> {
        Box::pin(async move {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.injected_failure() {
                return Err(err.with_context(format!("table '{table}'")));
            }

            let reject = self.reject.lock().unwrap_or_else(|p| p.into_inner());
            let mut tables = self.tables();
            let state = tables
                .get_mut(table)
                .ok_or_else(|| ClientError::config(format!("table '{table}' does not exist")))?;

            if let Some(previous) = state.tokens.get(idempotency_token) {
                tracing::debug!(table, token = idempotency_token, "replayed idempotency token");
                return Ok(previous
                    .iter()
                    .map(|s| match s {
                        UpsertStatus::Written => UpsertStatus::Unchanged,
                        other => other.clone(),
                    })
                    .collect());
            }

            let statuses = state.upsert(records, reject.as_deref());
            state.tokens.insert(idempotency_token, statuses.clone());
            Ok(statuses)
        })
    }

    fn compact<'a>(
        &'a self,
        table: &'a str,
        range: CompactionRange,
    ) -> Pin<Box<dyn Future<Output = Result<CompactionStats, ClientError>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_compaction.load(Ordering::SeqCst) {
                return Err(ClientError::io(format!("table '{table}': injected compaction failure")));
            }
            let prune_before = self.retention_ms.map(|r| ingest_api::now_ms() - r);
            let mut tables = self.tables();
            let state = tables
                .get_mut(table)
                .ok_or_else(|| ClientError::config(format!("table '{table}' does not exist")))?;
            Ok(state.compact(range, prune_before))
        })
    }
}
