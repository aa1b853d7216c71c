use std::sync::Arc;

use broker_memory::MemoryBroker;
use cache_memory::MemoryCache;
use ingest_api::broker::{BrokerClient, MessagePublisher};
use ingest_api::cache::CacheClient;
use ingest_api::store::AnalyticalStore;
use ingest_engine::config::BackendConfig;
use ingest_engine::{EngineError, IngestConfig, PipelineDeps, dead_letter};
use storage_clickhouse::ClickHouseStore;
use storage_memory::MemoryStore;

use crate::error::ServerError;

/// Backends selected by the `[broker]`, `[store]` and `[cache]` sections.
pub struct Backends {
    pub deps: PipelineDeps,
    /// Set when the broker runs in-process and accepts HTTP publishes.
    pub publisher: Option<Arc<dyn MessagePublisher>>,
}

fn unknown(section: &str, backend: &BackendConfig) -> ServerError {
    ServerError::Engine(EngineError::UnknownBackend {
        section: section.to_string(),
        kind: backend.kind.clone(),
    })
}

pub async fn build(config: &IngestConfig) -> Result<Backends, ServerError> {
    let (broker, publisher): (Arc<dyn BrokerClient>, Option<Arc<dyn MessagePublisher>>) =
        match config.broker.kind.as_str() {
            "memory" => {
                let broker = Arc::new(
                    MemoryBroker::from_options(&config.broker.options())
                        .map_err(ServerError::backend("broker"))?,
                );
                (broker.clone(), Some(broker))
            }
            _ => return Err(unknown("broker", &config.broker)),
        };

    let store: Arc<dyn AnalyticalStore> = match config.store.kind.as_str() {
        "memory" => Arc::new(
            MemoryStore::from_options(&config.store.options()).map_err(ServerError::backend("store"))?,
        ),
        "clickhouse" => Arc::new(
            ClickHouseStore::from_options(&config.store.options())
                .map_err(ServerError::backend("store"))?,
        ),
        _ => return Err(unknown("store", &config.store)),
    };

    let cache: Option<Arc<dyn CacheClient>> = match &config.cache {
        None => None,
        Some(section) if section.kind == "memory" => Some(Arc::new(
            MemoryCache::from_options(&section.options()).map_err(ServerError::backend("cache"))?,
        )),
        Some(section) => return Err(unknown("cache", section)),
    };

    let dead_letter = dead_letter::open_sink(&config.dead_letter_sink).await?;

    tracing::info!(
        broker = %config.broker.kind,
        store = %config.store.kind,
        cache = config.cache.as_ref().map(|c| c.kind.as_str()).unwrap_or("disabled"),
        dead_letter = %config.dead_letter_sink,
        "backends ready"
    );

    Ok(Backends {
        deps: PipelineDeps {
            broker,
            store,
            cache,
            dead_letter,
        },
        publisher,
    })
}
