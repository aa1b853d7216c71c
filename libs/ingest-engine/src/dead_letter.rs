use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::io::AsyncWriteExt;

use ingest_api::dead_letter::{DeadLetterEntry, DeadLetterSink};
use ingest_api::{ClientError, RawMessage};

use crate::error::EngineError;
use crate::validator::RejectionReason;

/// Why a message ended up in the dead-letter sink.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeadLetterReason {
    #[error(transparent)]
    Validation(#[from] RejectionReason),

    #[error("store rejected record: {0}")]
    StoreRejected(String),
}

impl DeadLetterReason {
    pub fn kind(&self) -> &'static str {
        match self {
            DeadLetterReason::Validation(r) => r.kind(),
            DeadLetterReason::StoreRejected(_) => "store_rejected",
        }
    }

    pub fn entry_for(&self, msg: &RawMessage) -> DeadLetterEntry {
        DeadLetterEntry {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
            delivery_attempt: msg.delivery_attempt,
            enqueue_time_ms: msg.enqueue_time_ms,
            schema_id: msg.schema_id.clone(),
            payload_base64: STANDARD.encode(&msg.payload),
            reason_kind: self.kind().to_string(),
            reason: self.to_string(),
            dead_lettered_at_ms: ingest_api::now_ms(),
        }
    }
}

/// Keeps entries in memory. For tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl DeadLetterSink for MemoryDeadLetterSink {
    fn append(
        &self,
        entry: DeadLetterEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + '_>> {
        Box::pin(async move {
            self.entries.lock().unwrap_or_else(|p| p.into_inner()).push(entry);
            Ok(())
        })
    }
}

/// Appends one JSON object per line to a file.
///
/// Writers are serialized so lines never interleave.
pub struct FileDeadLetterSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileDeadLetterSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ClientError::from(e).with_context(parent.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ClientError::from(e).with_context(path.display()))?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeadLetterSink for FileDeadLetterSink {
    fn append(
        &self,
        entry: DeadLetterEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + '_>> {
        Box::pin(async move {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            let mut file = self.file.lock().await;
            file.write_all(&line).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

/// Open the sink named by `dead_letter_sink`: `memory` or `file:<path>`.
pub async fn open_sink(target: &str) -> Result<Arc<dyn DeadLetterSink>, EngineError> {
    match target.split_once(':') {
        _ if target == "memory" => Ok(Arc::new(MemoryDeadLetterSink::new())),
        Some(("file", path)) if !path.is_empty() => {
            let sink = FileDeadLetterSink::open(path).await?;
            tracing::info!(path = %sink.path().display(), "dead-letter sink opened");
            Ok(Arc::new(sink))
        }
        _ => Err(EngineError::Config(format!(
            "dead_letter_sink '{target}': expected 'memory' or 'file:<path>'"
        ))),
    }
}
