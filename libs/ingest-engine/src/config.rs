use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use ingest_api::PartitionId;

use crate::error::EngineError;

/// Root configuration. Loaded once into an immutable snapshot; a reload
/// builds a new snapshot and hands it to [`crate::pipeline::Pipeline::reload`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IngestConfig {
    /// HTTP API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Broker topic carrying raw market-data messages.
    pub topic: String,

    /// Partitions consumed by this process.
    #[serde(default = "default_partitions")]
    pub partitions: Vec<PartitionId>,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub writer: WriterConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,

    /// `memory` or `file:<path>`.
    #[serde(default = "default_dead_letter_sink", alias = "deadLetterSink")]
    pub dead_letter_sink: String,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Schema used for messages that carry no `schema_id`.
    #[serde(default)]
    pub default_schema: Option<String>,

    #[serde(default)]
    pub schemas: Vec<SchemaConfig>,

    #[serde(default)]
    pub broker: BackendConfig,

    #[serde(default)]
    pub store: BackendConfig,

    /// No section = cache mirroring disabled.
    #[serde(default)]
    pub cache: Option<BackendConfig>,
}

fn default_api_port() -> u16 {
    9300
}

fn default_partitions() -> Vec<PartitionId> {
    vec![0]
}

fn default_dead_letter_sink() -> String {
    "file:dead-letter.jsonl".into()
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_batch_size", alias = "maxBatchSize")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_wait_seconds", alias = "maxBatchWaitSeconds")]
    pub max_batch_wait_seconds: u64,
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_batch_wait_seconds() -> u64 {
    30
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_wait_seconds: default_max_batch_wait_seconds(),
        }
    }
}

impl BatchConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_batch_wait_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsumerConfig {
    /// Unacknowledged messages allowed per partition before polling suspends.
    #[serde(default = "default_max_in_flight", alias = "maxInFlight")]
    pub max_in_flight: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

fn default_max_in_flight() -> usize {
    1_000
}

fn default_poll_timeout_ms() -> u64 {
    500
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriterConfig {
    /// Batch-writer pool size, independent of partition count.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Closed batches waiting for a writer.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_write_retries", alias = "maxWriteRetries")]
    pub max_write_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Continuous store failure longer than this is reported as fatal.
    #[serde(default = "default_store_unavailable_fatal_seconds")]
    pub store_unavailable_fatal_seconds: u64,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_write_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_store_unavailable_fatal_seconds() -> u64 {
    600
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_write_retries: default_max_write_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            store_unavailable_fatal_seconds: default_store_unavailable_fatal_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Written records since the last successful compaction that trigger a run.
    #[serde(default = "default_compaction_threshold", alias = "compactionThreshold")]
    pub compaction_threshold: u64,
    #[serde(default = "default_compaction_interval_minutes", alias = "compactionIntervalMinutes")]
    pub compaction_interval_minutes: u64,
}

fn default_true() -> bool {
    true
}

fn default_compaction_threshold() -> u64 {
    5_000
}

fn default_compaction_interval_minutes() -> u64 {
    60
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compaction_threshold: default_compaction_threshold(),
            compaction_interval_minutes: default_compaction_interval_minutes(),
        }
    }
}

impl CompactionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_minutes * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_drain_timeout_seconds")]
    pub drain_timeout_seconds: u64,
}

fn default_drain_timeout_seconds() -> u64 {
    10
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_seconds: default_drain_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TelemetryConfig {
    /// Seconds between telemetry log lines. 0 disables the reporter.
    #[serde(default = "default_report_interval_seconds")]
    pub report_interval_seconds: u64,
}

fn default_report_interval_seconds() -> u64 {
    30
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            report_interval_seconds: default_report_interval_seconds(),
        }
    }
}

/// Backend selection: `kind` plus whatever options that backend takes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

fn default_backend_kind() -> String {
    "memory".into()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            options: serde_json::Map::new(),
        }
    }
}

impl BackendConfig {
    pub fn options(&self) -> serde_json::Value {
        serde_json::Value::Object(self.options.clone())
    }
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

/// Declarative validation rules for one message schema.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchemaConfig {
    pub id: String,
    /// Destination table in the analytical store.
    pub table: String,
    pub key_field: String,
    pub ts_field: String,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    /// Fields mirrored into the cache after a successful commit.
    #[serde(default)]
    pub cache_fields: Vec<String>,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Bool,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// A configuration file format. TOML is built in; other formats plug in
/// through this trait and are selected by file extension.
pub trait ConfigParser {
    fn extensions(&self) -> &[&str];
    fn parse(&self, content: &str) -> Result<IngestConfig, EngineError>;
}

pub struct TomlParser;

impl ConfigParser for TomlParser {
    fn extensions(&self) -> &[&str] {
        &["toml"]
    }

    fn parse(&self, content: &str) -> Result<IngestConfig, EngineError> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        Self::load_with(path, &[&TomlParser])
    }

    /// Load configuration with the parser matching the file extension.
    pub fn load_with(path: &str, parsers: &[&dyn ConfigParser]) -> Result<Self, EngineError> {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("toml");
        let parser = parsers
            .iter()
            .find(|p| p.extensions().contains(&ext))
            .ok_or_else(|| EngineError::Config(format!("{path}: no parser for '.{ext}' files")))?;

        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        let config = parser.parse(&content).map_err(|e| e.with_context(path))?;
        config.validate().map_err(|e| e.with_context(path))?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        let config = TomlParser.parse(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.topic.is_empty() {
            return Err(EngineError::Config("topic must not be empty".into()));
        }
        if self.partitions.is_empty() {
            return Err(EngineError::Config("at least one partition is required".into()));
        }
        let mut seen = HashSet::new();
        for p in &self.partitions {
            if !seen.insert(p) {
                return Err(EngineError::Config(format!("partition {p} listed twice")));
            }
        }
        if self.batch.max_batch_size == 0 {
            return Err(EngineError::Config("batch.max_batch_size must be > 0".into()));
        }
        if self.batch.max_batch_wait_seconds == 0 {
            return Err(EngineError::Config("batch.max_batch_wait_seconds must be > 0".into()));
        }
        if self.consumer.max_in_flight == 0 {
            return Err(EngineError::Config("consumer.max_in_flight must be > 0".into()));
        }
        // A size close needs a full batch of unacknowledged messages in flight.
        if self.consumer.max_in_flight < self.batch.max_batch_size {
            return Err(EngineError::Config(format!(
                "consumer.max_in_flight ({}) must be >= batch.max_batch_size ({})",
                self.consumer.max_in_flight, self.batch.max_batch_size
            )));
        }
        if self.writer.workers == 0 || self.writer.queue_capacity == 0 {
            return Err(EngineError::Config(
                "writer.workers and writer.queue_capacity must be > 0".into(),
            ));
        }
        if self.compaction.compaction_interval_minutes == 0 {
            return Err(EngineError::Config(
                "compaction.compaction_interval_minutes must be > 0".into(),
            ));
        }

        let mut ids = HashSet::new();
        for schema in &self.schemas {
            let ctx = format!("schema '{}'", schema.id);
            if !ids.insert(schema.id.as_str()) {
                return Err(EngineError::Config(format!("{ctx}: duplicate schema id")));
            }
            if schema.table.is_empty() {
                return Err(EngineError::Config(format!("{ctx}: table must not be empty")));
            }
            for field in &schema.fields {
                if let (Some(min), Some(max)) = (field.min, field.max) {
                    if min > max {
                        return Err(EngineError::Config(format!(
                            "{ctx}: field '{}' has min > max",
                            field.name
                        )));
                    }
                }
            }
            for cached in &schema.cache_fields {
                if !schema.fields.iter().any(|f| &f.name == cached) {
                    return Err(EngineError::Config(format!(
                        "{ctx}: cache field '{cached}' is not a declared field"
                    )));
                }
            }
        }
        if let Some(default) = &self.default_schema {
            if !ids.contains(default.as_str()) {
                return Err(EngineError::Config(format!(
                    "default_schema '{default}' is not defined"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        topic = "market-data"

        [[schemas]]
        id = "quote"
        table = "quotes"
        key_field = "symbol"
        ts_field = "ts_ms"
    "#;

    #[test]
    fn defaults_apply() {
        let config = IngestConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.partitions, vec![0]);
        assert_eq!(config.batch.max_batch_size, 100);
        assert_eq!(config.batch.max_wait(), Duration::from_secs(30));
        assert_eq!(config.compaction.compaction_threshold, 5_000);
        assert_eq!(config.compaction.interval(), Duration::from_secs(3_600));
        assert_eq!(config.broker.kind, "memory");
        assert!(config.cache.is_none());
    }

    #[test]
    fn camel_case_option_names_are_accepted() {
        let config = IngestConfig::parse(
            r#"
            topic = "market-data"
            deadLetterSink = "memory"

            [batch]
            maxBatchSize = 50
            maxBatchWaitSeconds = 5

            [consumer]
            maxInFlight = 200

            [writer]
            maxWriteRetries = 2

            [compaction]
            compactionThreshold = 10
            compactionIntervalMinutes = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.dead_letter_sink, "memory");
        assert_eq!(config.batch.max_batch_size, 50);
        assert_eq!(config.batch.max_batch_wait_seconds, 5);
        assert_eq!(config.consumer.max_in_flight, 200);
        assert_eq!(config.writer.max_write_retries, 2);
        assert_eq!(config.compaction.compaction_threshold, 10);
    }

    #[test]
    fn backend_options_are_kept() {
        let config = IngestConfig::parse(
            r#"
            topic = "market-data"

            [store]
            kind = "clickhouse"
            host = "ch.internal"
            port = 8123

            [cache]
            kind = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.store.kind, "clickhouse");
        assert_eq!(config.store.options()["host"], "ch.internal");
        assert_eq!(config.store.options()["port"], 8123);
        assert_eq!(config.cache.unwrap().kind, "memory");
    }

    #[test]
    fn rejects_invalid_settings() {
        let zero_batch = format!("{MINIMAL}\n[batch]\nmax_batch_size = 0\n");
        assert!(IngestConfig::parse(&zero_batch).is_err());

        let duplicate = format!(
            "{MINIMAL}\n[[schemas]]\nid = \"quote\"\ntable = \"t\"\nkey_field = \"k\"\nts_field = \"ts\"\n"
        );
        let err = IngestConfig::parse(&duplicate).unwrap_err();
        assert!(err.to_string().contains("duplicate schema id"));

        let unknown_default = format!("default_schema = \"trade\"\n{MINIMAL}");
        assert!(IngestConfig::parse(&unknown_default).is_err());
    }

    #[test]
    fn in_flight_limit_must_hold_a_full_batch() {
        let starved = format!("{MINIMAL}\n[batch]\nmax_batch_size = 500\n[consumer]\nmax_in_flight = 100\n");
        let err = IngestConfig::parse(&starved).unwrap_err();
        assert!(err.to_string().contains("consumer.max_in_flight (100) must be >= batch.max_batch_size (500)"));

        let exact = format!("{MINIMAL}\n[batch]\nmax_batch_size = 100\n[consumer]\nmax_in_flight = 100\n");
        assert!(IngestConfig::parse(&exact).is_ok());
    }

    #[test]
    fn cache_fields_must_be_declared() {
        let err = IngestConfig::parse(
            r#"
            topic = "market-data"

            [[schemas]]
            id = "quote"
            table = "quotes"
            key_field = "symbol"
            ts_field = "ts_ms"
            cache_fields = ["bid"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cache field 'bid'"));
    }

    #[test]
    fn load_picks_parser_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = IngestConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.schemas.len(), 1);

        let yaml = dir.path().join("ingest.yaml");
        std::fs::write(&yaml, "topic: x").unwrap();
        let err = IngestConfig::load(yaml.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("no parser"));
    }
}
