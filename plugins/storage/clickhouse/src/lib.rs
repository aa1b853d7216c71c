use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use ingest_api::store::{AnalyticalStore, CompactionRange, CompactionStats, UpsertStatus};
use ingest_api::{ClientError, ValidatedRecord};

/// Tables are partitioned by UTC day of `ts_ms`.
const DAY_MS: i64 = 86_400_000;

/// ClickHouse exception codes that no retry can fix: missing column, unknown
/// identifier, unknown table, syntax error, unknown database, access denied,
/// bad credentials.
const PERMANENT_CODES: &[u32] = &[16, 47, 60, 62, 81, 497, 516];

// ════════════════════════════════════════════════════════════════
//  Config
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ClickHouseStoreConfig {
    // ── Connection ──
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // ── Table ──
    /// How many recent insert tokens each table remembers for deduplication.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: u64,
    /// Extra `SETTINGS` for CREATE TABLE. Overrides the defaults.
    #[serde(default)]
    pub table_settings: Option<HashMap<String, String>>,
    /// Day partitions entirely older than this are dropped by compaction.
    #[serde(default)]
    pub retention_hours: Option<u64>,

    // ── Insert tuning ──
    #[serde(default)]
    pub async_insert: bool,
}

fn default_port() -> u16 { 8123 }
fn default_user() -> String { "default".into() }
fn default_database() -> String { "default".into() }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_dedup_window() -> u64 { 1_000 }

// ════════════════════════════════════════════════════════════════
//  ClickHouseStore
// ════════════════════════════════════════════════════════════════

/// Analytical store on ClickHouse's HTTP interface.
///
/// Each table is a ReplacingMergeTree ordered by `(natural_key, ts_ms)` with
/// `ingested_at` as the version column, so the latest write for a key wins
/// once parts are merged. Record fields are kept as a JSON string in `data`.
///
/// Replays are absorbed with `insert_deduplication_token`: an insert whose
/// token is still inside the table's deduplication window is dropped by the
/// server.
pub struct ClickHouseStore {
    http: reqwest::Client,
    base_url: String,
    config: ClickHouseStoreConfig,
}

impl ClickHouseStore {
    pub fn new(config: ClickHouseStoreConfig) -> Result<Self, ClientError> {
        let scheme = if config.tls { "https" } else { "http" };
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ClientError::config(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: format!("{scheme}://{}:{}", config.host, config.port),
            config,
        })
    }

    /// Build from the `[store]` section options.
    pub fn from_options(options: &serde_json::Value) -> Result<Self, ClientError> {
        let config: ClickHouseStoreConfig = serde_json::from_value(options.clone())
            .map_err(|e| ClientError::config(format!("clickhouse store config: {e}")))?;
        validate_identifier(&config.database, "database")?;
        Self::new(config)
    }

    fn auth_params(&self) -> Vec<(&str, &str)> {
        vec![
            ("user", self.config.user.as_str()),
            ("password", self.config.password.as_str()),
            ("database", self.config.database.as_str()),
        ]
    }

    /// Execute a statement (DDL, SELECT, OPTIMIZE). Body = SQL text.
    async fn exec(&self, sql: &str) -> Result<String, ClientError> {
        let resp = self
            .http
            .post(&self.base_url)
            .query(&self.auth_params())
            .body(sql.to_owned())
            .send()
            .await
            .map_err(|e| ClientError::io(format!("CH request: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| ClientError::io(format!("CH read: {e}")))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(server_error(&body))
        }
    }

    /// Execute an INSERT ... FORMAT JSONEachRow. The statement goes in the
    /// `query` URL parameter, the NDJSON rows in the POST body.
    async fn exec_insert(&self, insert_sql: &str, ndjson_body: String, token: &str) -> Result<(), ClientError> {
        let mut params = self.auth_params();
        params.push(("query", insert_sql));
        params.push(("insert_deduplication_token", token));
        if self.config.async_insert {
            params.push(("async_insert", "1"));
            params.push(("wait_for_async_insert", "1"));
            params.push(("async_insert_deduplicate", "1"));
        }

        let resp = self
            .http
            .post(&self.base_url)
            .query(&params)
            .body(ndjson_body)
            .send()
            .await
            .map_err(|e| ClientError::io(format!("CH insert: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let body = resp.text().await.map_err(|e| ClientError::io(format!("CH read: {e}")))?;
            Err(server_error(&body))
        }
    }

    async fn partitions(&self, table: &str) -> Result<Vec<PartitionParts>, ClientError> {
        let body = self.exec(&parts_query(&self.config.database, table)).await?;
        parse_parts(&body)
    }

    fn prune_before(&self) -> Option<i64> {
        self.config
            .retention_hours
            .map(|h| ingest_api::now_ms() - h as i64 * 3_600_000)
    }
}

// ════════════════════════════════════════════════════════════════
//  AnalyticalStore impl
// ════════════════════════════════════════════════════════════════

impl AnalyticalStore for ClickHouseStore {
    fn ensure_table<'a>(
        &'a self,
        table: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>> {
        Box::pin(async move {
            validate_identifier(table, "table")?;
            let ddl = generate_create_table(
                table,
                self.config.dedup_window,
                self.config.table_settings.as_ref(),
            );
            self.exec(&ddl)
                .await
                .map_err(|e| e.with_context(format!("create table '{table}'")))?;
            tracing::info!(table, database = %self.config.database, "clickhouse table ready");
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
            validate_identifier(table, "table")?;
            let (body, statuses) = encode_rows(records)?;
            if body.is_empty() {
                return Ok(statuses);
            }

            let insert_sql = format!("INSERT INTO {table} (natural_key, ts_ms, data) FORMAT JSONEachRow");
            self.exec_insert(&insert_sql, body, idempotency_token)
                .await
                .map_err(|e| e.with_context(format!("insert into '{table}'")))?;
            tracing::debug!(table, rows = records.len(), token = idempotency_token, "clickhouse insert");
            Ok(statuses)
        })
    }

    fn compact<'a>(
        &'a self,
        table: &'a str,
        range: CompactionRange,
    ) -> Pin<Box<dyn Future<Output = Result<CompactionStats, ClientError>> + Send + 'a>> {
        Box::pin(async move {
            validate_identifier(table, "table")?;
            let before = self.partitions(table).await?;
            let actions = plan_compaction(&before, range.before_ts_ms, self.prune_before());

            let mut stats = CompactionStats::default();
            let mut optimized = Vec::new();
            for action in &actions {
                match *action {
                    PartitionAction::Drop { day, rows } => {
                        self.exec(&format!("ALTER TABLE {table} DROP PARTITION {day}")).await?;
                        stats.rows_pruned += rows;
                        tracing::info!(table, day, rows, "retention dropped partition");
                    }
                    PartitionAction::Optimize { day, rows } => {
                        self.exec(&format!("OPTIMIZE TABLE {table} PARTITION {day} FINAL")).await?;
                        optimized.push((day, rows));
                    }
                }
            }

            if !optimized.is_empty() {
                let after = self.partitions(table).await?;
                for (day, rows_before) in optimized {
                    let rows_after = after
                        .iter()
                        .find(|p| p.day() == Some(day))
                        .map(|p| p.rows)
                        .unwrap_or(0);
                    stats.rows_merged += rows_before.saturating_sub(rows_after);
                }
            }
            Ok(stats)
        })
    }
}

// ════════════════════════════════════════════════════════════════
//  SQL helpers
// ════════════════════════════════════════════════════════════════

/// Check that `name` is a plain ClickHouse identifier that is safe to splice
/// into SQL unquoted.
pub fn validate_identifier(name: &str, what: &str) -> Result<(), ClientError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(ClientError::config(format!("invalid {what} name '{name}'")))
    }
}

/// Escape a value for a single-quoted ClickHouse string literal.
fn escape_ch_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn generate_create_table(
    table: &str,
    dedup_window: u64,
    table_settings: Option<&HashMap<String, String>>,
) -> String {
    let mut settings = BTreeMap::new();
    settings.insert("non_replicated_deduplication_window".to_string(), dedup_window.to_string());
    if let Some(extra) = table_settings {
        settings.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    let settings: Vec<String> = settings.iter().map(|(k, v)| format!("{k} = {v}")).collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         \x20   natural_key LowCardinality(String),\n\
         \x20   ts_ms       Int64,\n\
         \x20   data        String,\n\
         \x20   ingested_at DateTime64(3) DEFAULT now64(3)\n\
         ) ENGINE = ReplacingMergeTree(ingested_at)\n\
         PARTITION BY intDiv(ts_ms, {DAY_MS})\n\
         ORDER BY (natural_key, ts_ms)\n\
         SETTINGS {}",
        settings.join(", ")
    )
}

fn parts_query(database: &str, table: &str) -> String {
    format!(
        "SELECT partition, count() AS parts, sum(rows) AS rows FROM system.parts \
         WHERE database = '{}' AND table = '{}' AND active GROUP BY partition \
         SETTINGS output_format_json_quote_64bit_integers = 0 FORMAT JSONEachRow",
        escape_ch_string(database),
        escape_ch_string(table),
    )
}

#[derive(serde::Serialize)]
struct Row<'a> {
    natural_key: &'a str,
    ts_ms: i64,
    data: String,
}

/// Encode insertable records as NDJSON. Records the table cannot hold are
/// rejected individually and left out of the body.
fn encode_rows(records: &[ValidatedRecord]) -> Result<(String, Vec<UpsertStatus>), ClientError> {
    let mut body = String::new();
    let mut statuses = Vec::with_capacity(records.len());
    for record in records {
        if record.natural_key.is_empty() {
            statuses.push(UpsertStatus::Rejected("empty natural key".into()));
            continue;
        }
        if record.ts_ms < 0 {
            statuses.push(UpsertStatus::Rejected(format!("timestamp {} before epoch", record.ts_ms)));
            continue;
        }
        let row = Row {
            natural_key: &record.natural_key,
            ts_ms: record.ts_ms,
            data: serde_json::to_string(&record.fields)?,
        };
        body.push_str(&serde_json::to_string(&row)?);
        body.push('\n');
        statuses.push(UpsertStatus::Written);
    }
    Ok((body, statuses))
}

/// Extract `N` from a `Code: N. DB::Exception: ...` response body.
fn exception_code(body: &str) -> Option<u32> {
    body.trim_start()
        .strip_prefix("Code: ")?
        .split('.')
        .next()?
        .trim()
        .parse()
        .ok()
}

fn server_error(body: &str) -> ClientError {
    let message = body.trim();
    match exception_code(message) {
        Some(code) if PERMANENT_CODES.contains(&code) => ClientError::config(message),
        _ => ClientError::io(message),
    }
}

// ════════════════════════════════════════════════════════════════
//  Compaction planning
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, serde::Deserialize)]
struct PartitionParts {
    partition: String,
    parts: u64,
    rows: u64,
}

impl PartitionParts {
    fn day(&self) -> Option<i64> {
        self.partition.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionAction {
    Optimize { day: i64, rows: u64 },
    Drop { day: i64, rows: u64 },
}

fn parse_parts(body: &str) -> Result<Vec<PartitionParts>, ClientError> {
    body.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| ClientError::format(format!("parse system.parts row: {e}")))
        })
        .collect()
}

/// Decide what to do with each day partition.
///
/// Only partitions whose whole day lies before `before_ts_ms` are touched.
/// Those also past retention are dropped; the rest are merged if they hold
/// more than one part.
fn plan_compaction(
    partitions: &[PartitionParts],
    before_ts_ms: i64,
    prune_before: Option<i64>,
) -> Vec<PartitionAction> {
    let mut actions = Vec::new();
    for p in partitions {
        let Some(day) = p.day() else {
            tracing::warn!(partition = %p.partition, "skipping partition with unexpected id");
            continue;
        };
        let day_end = (day + 1) * DAY_MS;
        if day_end > before_ts_ms {
            continue;
        }
        if prune_before.is_some_and(|cutoff| day_end <= cutoff) {
            actions.push(PartitionAction::Drop { day, rows: p.rows });
        } else if p.parts > 1 {
            actions.push(PartitionAction::Optimize { day, rows: p.rows });
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(key: &str, ts_ms: i64) -> ValidatedRecord {
        let mut fields = serde_json::Map::new();
        fields.insert("bid".into(), json!(1.5));
        ValidatedRecord {
            schema_id: "quote".into(),
            natural_key: key.into(),
            ts_ms,
            fields,
            source: Default::default(),
        }
    }

    fn parts(partition: &str, parts: u64, rows: u64) -> PartitionParts {
        PartitionParts {
            partition: partition.into(),
            parts,
            rows,
        }
    }

    #[test]
    fn identifiers() {
        assert!(validate_identifier("quotes", "table").is_ok());
        assert!(validate_identifier("_trades_v2", "table").is_ok());
        for bad in ["", "2quotes", "quotes; DROP TABLE x", "a-b", "q.t"] {
            let err = validate_identifier(bad, "table").unwrap_err();
            assert!(!err.is_transient(), "{bad}");
        }
    }

    #[test]
    fn create_table_ddl() {
        let ddl = generate_create_table("quotes", 1_000, None);
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS quotes ("));
        assert!(ddl.contains("ENGINE = ReplacingMergeTree(ingested_at)"));
        assert!(ddl.contains("PARTITION BY intDiv(ts_ms, 86400000)"));
        assert!(ddl.contains("ORDER BY (natural_key, ts_ms)"));
        assert!(ddl.ends_with("SETTINGS non_replicated_deduplication_window = 1000"));
    }

    #[test]
    fn table_settings_override_defaults() {
        let mut extra = HashMap::new();
        extra.insert("non_replicated_deduplication_window".to_string(), "50".to_string());
        extra.insert("index_granularity".to_string(), "4096".to_string());
        let ddl = generate_create_table("quotes", 1_000, Some(&extra));
        assert!(ddl.ends_with(
            "SETTINGS index_granularity = 4096, non_replicated_deduplication_window = 50"
        ));
    }

    #[test]
    fn rows_are_ndjson_with_fields_as_string() {
        let records = [record("AAPL", 1_000), record("", 1_001), record("MSFT", -1)];
        let (body, statuses) = encode_rows(&records).unwrap();

        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 1);
        let row: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(row["natural_key"], "AAPL");
        assert_eq!(row["ts_ms"], 1_000);
        assert_eq!(row["data"], r#"{"bid":1.5}"#);

        assert_eq!(statuses[0], UpsertStatus::Written);
        assert!(matches!(&statuses[1], UpsertStatus::Rejected(r) if r.contains("natural key")));
        assert!(matches!(&statuses[2], UpsertStatus::Rejected(r) if r.contains("before epoch")));
    }

    #[test]
    fn server_errors_are_classified_by_code() {
        let missing = server_error("Code: 60. DB::Exception: Table default.quotes does not exist. (UNKNOWN_TABLE)\n");
        assert!(!missing.is_transient());
        assert!(missing.message.starts_with("Code: 60."));

        let overloaded = server_error("Code: 202. DB::Exception: Too many simultaneous queries. (TOO_MANY_SIMULTANEOUS_QUERIES)");
        assert!(overloaded.is_transient());

        assert!(server_error("502 Bad Gateway").is_transient());
        assert_eq!(exception_code("  Code: 516. DB::Exception: auth"), Some(516));
    }

    #[test]
    fn parts_rows_parse() {
        let body = "{\"partition\":\"19700\",\"parts\":3,\"rows\":120}\n{\"partition\":\"19701\",\"parts\":1,\"rows\":7}\n";
        let parsed = parse_parts(body).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].day(), Some(19_700));
        assert_eq!(parsed[1].rows, 7);

        assert!(parse_parts("{\"partition\":1}").is_err());
    }

    #[test]
    fn compaction_touches_only_closed_days() {
        let partitions = [parts("0", 3, 30), parts("1", 4, 40), parts("2", 1, 10)];
        // Day 1 is still open: the fence sits inside it.
        let actions = plan_compaction(&partitions, DAY_MS + 5, None);
        assert_eq!(actions, vec![PartitionAction::Optimize { day: 0, rows: 30 }]);

        let actions = plan_compaction(&partitions, 3 * DAY_MS, None);
        assert_eq!(
            actions,
            vec![
                PartitionAction::Optimize { day: 0, rows: 30 },
                PartitionAction::Optimize { day: 1, rows: 40 },
            ]
        );
    }

    #[test]
    fn retention_drops_whole_days() {
        let partitions = [parts("0", 1, 30), parts("1", 2, 40), parts("all", 1, 1)];
        let actions = plan_compaction(&partitions, 3 * DAY_MS, Some(DAY_MS + 1));
        assert_eq!(
            actions,
            vec![
                PartitionAction::Drop { day: 0, rows: 30 },
                PartitionAction::Optimize { day: 1, rows: 40 },
            ]
        );
    }

    #[test]
    fn config_requires_host() {
        let err = ClickHouseStore::from_options(&json!({"port": 8123})).err().unwrap();
        assert!(err.message.contains("host"));

        let store = ClickHouseStore::from_options(&json!({"host": "ch.internal", "tls": true})).unwrap();
        assert_eq!(store.base_url, "https://ch.internal:8123");
        assert_eq!(store.config.database, "default");

        assert!(ClickHouseStore::from_options(&json!({"host": "h", "database": "a b"})).is_err());
    }

    #[test]
    fn parts_query_escapes_literals() {
        let sql = parts_query("analytics", "quotes");
        assert!(sql.contains("database = 'analytics' AND table = 'quotes'"));
        assert!(sql.ends_with("FORMAT JSONEachRow"));
        assert_eq!(escape_ch_string("o'brien\\"), "o\\'brien\\\\");
    }
}
