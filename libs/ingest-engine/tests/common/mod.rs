#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use broker_memory::{MemoryBroker, MemoryBrokerConfig};
use cache_memory::MemoryCache;
use ingest_api::broker::{BrokerClient, SubscriptionHandle};
use ingest_api::{ClientError, MessageRef, PartitionId, RawMessage};
use ingest_engine::dead_letter::MemoryDeadLetterSink;
use ingest_engine::{IngestConfig, Pipeline, PipelineDeps, PipelineMetrics};
use storage_memory::MemoryStore;

pub const TOPIC: &str = "market-data";

pub const BASE_CONFIG: &str = r#"
    topic = "market-data"
    dead_letter_sink = "memory"

    [telemetry]
    report_interval_seconds = 0

    [writer]
    workers = 2
    max_write_retries = 3
    initial_backoff_ms = 200

    [[schemas]]
    id = "quote"
    table = "quotes"
    key_field = "symbol"
    ts_field = "ts_ms"
    cache_fields = ["bid"]

    [[schemas.fields]]
    name = "bid"
    type = "float"
    required = true
    min = 0.0
"#;

/// One `quote` schema, memory dead-letter sink, no telemetry reporter.
/// Tests adjust fields directly.
pub fn base_config() -> IngestConfig {
    IngestConfig::parse(BASE_CONFIG).expect("test config")
}

pub fn quote(symbol: &str, ts_ms: i64, bid: f64) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({"symbol": symbol, "ts_ms": ts_ms, "bid": bid}))
        .expect("quote payload")
}

pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryCache>,
    pub dead_letter: Arc<MemoryDeadLetterSink>,
    pub metrics: Arc<PipelineMetrics>,
    pub pipeline: Pipeline,
}

impl Harness {
    pub async fn start(config: IngestConfig) -> Self {
        Self::start_with(config, |broker| broker as Arc<dyn BrokerClient>).await
    }

    /// Start with the pipeline talking to a wrapper around the memory broker.
    pub async fn start_with<F>(config: IngestConfig, wrap: F) -> Self
    where
        F: FnOnce(Arc<MemoryBroker>) -> Arc<dyn BrokerClient>,
    {
        Self::build(config, Arc::new(MemoryStore::default()), wrap).await
    }

    /// Start against a store that outlives an earlier harness, with a fresh
    /// broker whose offsets begin at zero again.
    pub async fn start_on_store(config: IngestConfig, store: Arc<MemoryStore>) -> Self {
        Self::build(config, store, |broker| broker as Arc<dyn BrokerClient>).await
    }

    async fn build<F>(config: IngestConfig, store: Arc<MemoryStore>, wrap: F) -> Self
    where
        F: FnOnce(Arc<MemoryBroker>) -> Arc<dyn BrokerClient>,
    {
        let broker = Arc::new(MemoryBroker::new(MemoryBrokerConfig {
            ack_deadline_ms: 5_000,
            redelivery_delay_ms: 1_000,
            partitions: 2,
        }));
        let cache = Arc::new(MemoryCache::default());
        let dead_letter = Arc::new(MemoryDeadLetterSink::new());

        let deps = PipelineDeps {
            broker: wrap(broker.clone()),
            store: store.clone(),
            cache: Some(cache.clone()),
            dead_letter: dead_letter.clone(),
        };
        let pipeline = Pipeline::start(config, deps).await.expect("pipeline start");
        let metrics = pipeline.metrics();

        Self {
            broker,
            store,
            cache,
            dead_letter,
            metrics,
            pipeline,
        }
    }

    /// Publish quotes `S{i}` for `i in range` to a partition.
    pub fn publish_quotes(&self, partition: PartitionId, range: std::ops::Range<usize>) {
        for i in range {
            let payload = quote(&format!("S{i}"), 1_000 + i as i64, i as f64);
            self.broker.append(TOPIC, partition, Some("quote".into()), payload);
        }
    }

    pub fn publish_raw(&self, partition: PartitionId, schema_id: Option<&str>, payload: &[u8]) {
        self.broker
            .append(TOPIC, partition, schema_id.map(str::to_string), payload.to_vec());
    }

    /// Unacknowledged messages in the partition.
    pub async fn unacked(&self, partition: PartitionId) -> u64 {
        unacked(&self.broker, partition).await
    }
}

/// Unacknowledged messages in the partition, usable after the harness's
/// pipeline has been moved out by `shutdown`.
pub async fn unacked(broker: &MemoryBroker, partition: PartitionId) -> u64 {
    let handle = SubscriptionHandle {
        topic: TOPIC.to_string(),
        partition,
    };
    broker.lag(&handle).await.expect("lag")
}

/// Let the pipeline run for `d` of (paused) time.
pub async fn advance(d: Duration) {
    tokio::time::sleep(d).await;
}

/// Broker wrapper whose first `n` acks fail, as if the process died between
/// commit and acknowledgment.
pub struct LosingAcks {
    inner: Arc<MemoryBroker>,
    remaining: AtomicU32,
}

impl LosingAcks {
    pub fn new(inner: Arc<MemoryBroker>, n: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(n),
        }
    }
}

impl BrokerClient for LosingAcks {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        partition: PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<SubscriptionHandle, ClientError>> + Send + 'a>> {
        self.inner.subscribe(topic, partition)
    }

    fn receive<'a>(
        &'a self,
        handle: &'a SubscriptionHandle,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RawMessage>, ClientError>> + Send + 'a>> {
        self.inner.receive(handle, timeout)
    }

    fn ack<'a>(
        &'a self,
        msg: &'a MessageRef,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>> {
        let lose = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lose {
            return Box::pin(async { Err(ClientError::io("connection reset")) });
        }
        self.inner.ack(msg)
    }

    fn nack<'a>(
        &'a self,
        msg: &'a MessageRef,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>> {
        self.inner.nack(msg)
    }

    fn lag<'a>(
        &'a self,
        handle: &'a SubscriptionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ClientError>> + Send + 'a>> {
        self.inner.lag(handle)
    }
}
