use ingest_api::ClientError;

use crate::batch::BatchId;
use crate::validator::RejectionReason;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("unknown {section} backend '{kind}'")]
    UnknownBackend { section: String, kind: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For `Client` variant, context is added to the inner `ClientError`.
    /// For `Config`, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Client(e) => EngineError::Client(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

/// Failures on the ingest path.
///
/// None of these stops the pipeline. Each is scoped to one record, one batch,
/// one cache key or one compaction run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestFault {
    /// Permanent. The message is dead-lettered and acknowledged.
    #[error("validation rejected: {0}")]
    ValidationRejection(#[from] RejectionReason),

    /// The store call failed as a whole; the batch is retried with backoff.
    #[error("transient write failure on '{table}' (attempt {attempt}): {source}")]
    TransientWriteFailure {
        table: String,
        attempt: u32,
        source: ClientError,
    },

    /// Retries exhausted or a permanent store error. Messages are nacked.
    #[error("batch {batch_id} failed after {attempts} attempt(s): {reason}")]
    BatchFailed {
        batch_id: BatchId,
        attempts: u32,
        reason: String,
    },

    /// Logged and swallowed.
    #[error("cache write for '{key}' failed: {source}")]
    CacheWriteFailure { key: String, source: ClientError },

    /// Logged; retried on the next scheduled trigger.
    #[error("compaction of '{table}' failed: {source}")]
    CompactionFailure { table: String, source: ClientError },
}

impl IngestFault {
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestFault::ValidationRejection(_) => false,
            IngestFault::TransientWriteFailure { source, .. } => source.is_transient(),
            IngestFault::BatchFailed { .. } => true,
            IngestFault::CacheWriteFailure { .. } => false,
            IngestFault::CompactionFailure { .. } => true,
        }
    }
}
