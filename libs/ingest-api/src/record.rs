use serde::Serialize;

use crate::message::MessageRef;

/// A record that passed validation and is ready to be batched.
///
/// `(natural_key, ts_ms)` identify the record for idempotent upsert.
/// `source` points back at the broker delivery and is used only for
/// acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedRecord {
    pub schema_id: String,
    pub natural_key: String,
    pub ts_ms: i64,
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    pub source: MessageRef,
}
