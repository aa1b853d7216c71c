use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::message::PartitionId;

/// One dead-lettered message: source metadata, why it was rejected, and the
/// original payload (base64) so an operator can re-inject it by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: u64,
    pub delivery_attempt: u32,
    pub enqueue_time_ms: i64,
    pub schema_id: Option<String>,
    pub payload_base64: String,
    /// Machine-readable reason, e.g. `missing_required_field`.
    pub reason_kind: String,
    pub reason: String,
    pub dead_lettered_at_ms: i64,
}

/// Append-only sink for permanently rejected messages.
///
/// Must be safe to call from many tasks at once.
pub trait DeadLetterSink: Send + Sync {
    fn append(
        &self,
        entry: DeadLetterEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + '_>>;
}
