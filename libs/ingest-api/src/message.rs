use serde::{Deserialize, Serialize};

/// Broker partition number.
pub type PartitionId = u32;

/// Identifies one delivery of one message. Used for ack/nack only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: u64,
    pub delivery_attempt: u32,
}

/// A message as received from the broker.
///
/// The payload is opaque until a validator interprets it. `schema_id` is the
/// metadata selector used to pick that validator.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: u64,
    /// 1 on first delivery, incremented by the broker on every redelivery.
    pub delivery_attempt: u32,
    /// Time the message was appended to the broker log (ms since epoch).
    pub enqueue_time_ms: i64,
    pub schema_id: Option<String>,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            delivery_attempt: self.delivery_attempt,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_attempt > 1
    }
}
