pub mod broker;
pub mod cache;
pub mod dead_letter;
pub mod error;
pub mod message;
pub mod record;
pub mod store;

pub use error::{ClientError, ErrorKind};
pub use message::{MessageRef, PartitionId, RawMessage};
pub use record::ValidatedRecord;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
