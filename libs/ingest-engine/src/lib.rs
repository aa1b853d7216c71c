pub mod ack;
pub mod batch;
pub mod batcher;
pub mod cache_updater;
pub mod commit;
pub mod compactor;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod health;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod retry;
pub mod validator;
pub mod writer;

pub use config::{ConfigParser, IngestConfig, TomlParser};
pub use error::{EngineError, IngestFault};
pub use health::Health;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{Pipeline, PipelineDeps};
