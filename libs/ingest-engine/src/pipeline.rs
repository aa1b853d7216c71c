use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ingest_api::broker::BrokerClient;
use ingest_api::cache::CacheClient;
use ingest_api::dead_letter::DeadLetterSink;
use ingest_api::store::AnalyticalStore;

use crate::ack::AckCoordinator;
use crate::batcher::Batcher;
use crate::cache_updater::CacheUpdater;
use crate::commit::{CommitStage, spawn_writer_pool};
use crate::compactor::{CompactionFence, CompactionTracker, Compactor};
use crate::config::IngestConfig;
use crate::consumer::PartitionConsumer;
use crate::error::EngineError;
use crate::health::{Health, HealthMonitor};
use crate::metrics::{PipelineMetrics, report_loop};
use crate::partition::PartitionWorker;
use crate::retry::RetryPolicy;
use crate::validator::{RegistryHandle, ValidatorRegistry};
use crate::writer::BatchWriter;

/// External collaborators the pipeline talks to.
#[derive(Clone)]
pub struct PipelineDeps {
    pub broker: Arc<dyn BrokerClient>,
    pub store: Arc<dyn AnalyticalStore>,
    pub cache: Option<Arc<dyn CacheClient>>,
    pub dead_letter: Arc<dyn DeadLetterSink>,
}

/// Running ingestion pipeline: one worker per partition, a shared writer
/// pool, and the background compactor and telemetry reporter.
pub struct Pipeline {
    config: IngestConfig,
    store: Arc<dyn AnalyticalStore>,
    registry: Arc<RegistryHandle>,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthMonitor>,
    compactor: Option<Arc<Compactor>>,
    /// Stops partition polling.
    stop: CancellationToken,
    /// Stops compactor and reporter.
    background: CancellationToken,
    partitions: Vec<JoinHandle<()>>,
    writers: Vec<JoinHandle<()>>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub async fn start(config: IngestConfig, deps: PipelineDeps) -> Result<Self, EngineError> {
        config.validate()?;

        let registry = ValidatorRegistry::from_config(&config)?;
        if registry.is_empty() {
            tracing::warn!("no schemas configured, every message will be dead-lettered");
        }
        for table in registry.tables() {
            deps.store
                .ensure_table(&table)
                .await
                .map_err(|e| EngineError::from(e).with_context(format!("table '{table}'")))?;
        }
        let registry = Arc::new(RegistryHandle::new(registry));

        let metrics = Arc::new(PipelineMetrics::new());
        let health = Arc::new(HealthMonitor::new(Duration::from_secs(
            config.writer.store_unavailable_fatal_seconds,
        )));
        let fence = Arc::new(CompactionFence::new());
        let tracker = Arc::new(CompactionTracker::new(config.compaction.compaction_threshold));
        let acks = Arc::new(AckCoordinator::new(
            deps.broker.clone(),
            deps.dead_letter.clone(),
            metrics.clone(),
        ));

        // Subscribe everything before spawning, so a failure leaves nothing running.
        let mut consumers = Vec::with_capacity(config.partitions.len());
        for &partition in &config.partitions {
            let consumer = PartitionConsumer::subscribe(
                deps.broker.clone(),
                &config.topic,
                partition,
                config.consumer.max_in_flight,
                Duration::from_millis(config.consumer.poll_timeout_ms),
                metrics.clone(),
            )
            .await?;
            consumers.push(consumer);
        }

        let stage = Arc::new(CommitStage {
            writer: BatchWriter::new(
                deps.store.clone(),
                RetryPolicy::from_config(&config.writer),
                metrics.clone(),
                health.clone(),
            ),
            cache: CacheUpdater::new(deps.cache.clone(), metrics.clone()),
            acks: acks.clone(),
            tracker: tracker.clone(),
            metrics: metrics.clone(),
        });
        let (work_tx, work_rx) = mpsc::channel(config.writer.queue_capacity);
        let writers = spawn_writer_pool(stage, work_rx, config.writer.workers);

        let stop = CancellationToken::new();
        let partitions = consumers
            .into_iter()
            .map(|consumer| {
                let batcher = Batcher::new(
                    config.topic.clone(),
                    consumer.partition(),
                    config.batch.max_batch_size,
                    config.batch.max_wait(),
                );
                let worker = PartitionWorker::new(
                    consumer,
                    batcher,
                    registry.clone(),
                    acks.clone(),
                    work_tx.clone(),
                    fence.clone(),
                    metrics.clone(),
                    stop.child_token(),
                );
                tokio::spawn(worker.run())
            })
            .collect();
        // Writers exit once the last partition drops its sender.
        drop(work_tx);

        let background = CancellationToken::new();
        let mut background_tasks = Vec::new();
        let compactor = if config.compaction.enabled {
            let compactor = Arc::new(Compactor::new(
                deps.store.clone(),
                registry.clone(),
                fence,
                tracker,
                metrics.clone(),
                config.compaction.interval(),
            ));
            background_tasks.push(tokio::spawn(compactor.clone().run(background.child_token())));
            Some(compactor)
        } else {
            None
        };
        if config.telemetry.report_interval_seconds > 0 {
            background_tasks.push(tokio::spawn(report_loop(
                metrics.clone(),
                Duration::from_secs(config.telemetry.report_interval_seconds),
                background.child_token(),
            )));
        }

        tracing::info!(
            topic = %config.topic,
            partitions = ?config.partitions,
            schemas = registry.snapshot().len(),
            writers = config.writer.workers,
            max_batch_size = config.batch.max_batch_size,
            max_batch_wait_s = config.batch.max_batch_wait_seconds,
            "pipeline started"
        );

        Ok(Self {
            config,
            store: deps.store,
            registry,
            metrics,
            health,
            compactor,
            stop,
            background,
            partitions,
            writers,
            background_tasks,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn health(&self) -> watch::Receiver<Health> {
        self.health.subscribe()
    }

    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        self.health.clone()
    }

    pub fn registry(&self) -> Arc<RegistryHandle> {
        self.registry.clone()
    }

    pub fn compactor(&self) -> Option<Arc<Compactor>> {
        self.compactor.clone()
    }

    /// Apply a new configuration snapshot.
    ///
    /// Schemas are swapped in place: records already batched keep the
    /// validator they were produced by. Everything else needs a restart and is
    /// only reported.
    pub async fn reload(&mut self, new: IngestConfig) -> Result<(), EngineError> {
        new.validate()?;
        let registry = ValidatorRegistry::from_config(&new)?;
        let known = self.registry.snapshot().tables();
        for table in registry.tables().difference(&known) {
            self.store
                .ensure_table(table)
                .await
                .map_err(|e| EngineError::from(e).with_context(format!("table '{table}'")))?;
            tracing::info!(table = %table, "table created on reload");
        }

        for section in restart_only_changes(&self.config, &new) {
            tracing::warn!(section, "configuration change requires a restart, ignored");
        }

        let schemas = registry.len();
        self.registry.replace(registry);
        self.config.schemas = new.schemas;
        self.config.default_schema = new.default_schema;
        tracing::info!(schemas, "validators reloaded");
        Ok(())
    }

    /// Stop polling, drain open and queued batches within the drain timeout,
    /// then stop the background tasks. Whatever is still running at the
    /// deadline is aborted; its messages stay unacked and are redelivered.
    pub async fn shutdown(self) {
        let drain = Duration::from_secs(self.config.shutdown.drain_timeout_seconds);
        let deadline = Instant::now() + drain;
        tracing::info!(drain_timeout_s = drain.as_secs(), "pipeline shutting down");

        self.stop.cancel();
        let aborted_partitions = join_until(self.partitions, deadline).await;
        let aborted_writers = join_until(self.writers, deadline).await;
        if aborted_partitions + aborted_writers > 0 {
            tracing::warn!(
                aborted_partitions,
                aborted_writers,
                "drain timeout reached, unresolved messages will be redelivered"
            );
        }

        self.background.cancel();
        for task in self.background_tasks {
            let _ = task.await;
        }
        tracing::info!("pipeline stopped");
    }
}

/// Await each task until `deadline`, aborting the ones still running. Returns
/// how many were aborted.
async fn join_until(tasks: Vec<JoinHandle<()>>, deadline: Instant) -> usize {
    let mut aborted = 0;
    for mut task in tasks {
        if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
            task.abort();
            aborted += 1;
        }
    }
    aborted
}

fn restart_only_changes(old: &IngestConfig, new: &IngestConfig) -> Vec<&'static str> {
    let mut changed = Vec::new();
    let mut check = |name: &'static str, differs: bool| {
        if differs {
            changed.push(name);
        }
    };
    check("api_port", old.api_port != new.api_port);
    check("topic", old.topic != new.topic);
    check("partitions", old.partitions != new.partitions);
    check("batch", old.batch != new.batch);
    check("consumer", old.consumer != new.consumer);
    check("writer", old.writer != new.writer);
    check("compaction", old.compaction != new.compaction);
    check("dead_letter_sink", old.dead_letter_sink != new.dead_letter_sink);
    check("shutdown", old.shutdown != new.shutdown);
    check("telemetry", old.telemetry != new.telemetry);
    check("broker", old.broker != new.broker);
    check("store", old.store != new.store);
    check("cache", old.cache != new.cache);
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        topic = "market-data"

        [[schemas]]
        id = "quote"
        table = "quotes"
        key_field = "symbol"
        ts_field = "ts_ms"
    "#;

    #[test]
    fn detects_restart_only_changes() {
        let old = IngestConfig::parse(BASE).unwrap();
        let mut new = old.clone();
        assert!(restart_only_changes(&old, &new).is_empty());

        new.batch.max_batch_size = 500;
        new.partitions = vec![0, 1];
        new.schemas.clear();
        assert_eq!(restart_only_changes(&old, &new), vec!["partitions", "batch"]);
    }
}
