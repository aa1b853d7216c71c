use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::ClientError;
use crate::message::{MessageRef, PartitionId, RawMessage};

/// Handle returned by [`BrokerClient::subscribe`], one per partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub topic: String,
    pub partition: PartitionId,
}

/// Consumer side of a partitioned, at-least-once message log.
///
/// Messages of one partition are delivered in offset order, including
/// redeliveries. A message that is neither acked nor nacked within the
/// broker's ack deadline is redelivered with an incremented delivery attempt.
pub trait BrokerClient: Send + Sync {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        partition: PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<SubscriptionHandle, ClientError>> + Send + 'a>>;

    /// Wait up to `timeout` for the next message. `Ok(None)` on timeout.
    ///
    /// Must be cancel-safe: a dropped receive future never loses a message.
    fn receive<'a>(
        &'a self,
        handle: &'a SubscriptionHandle,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RawMessage>, ClientError>> + Send + 'a>>;

    fn ack<'a>(
        &'a self,
        msg: &'a MessageRef,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>>;

    /// Return the message to the broker for redelivery.
    fn nack<'a>(
        &'a self,
        msg: &'a MessageRef,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>>;

    /// Number of messages in the partition that have not been acknowledged.
    fn lag<'a>(
        &'a self,
        handle: &'a SubscriptionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ClientError>> + Send + 'a>>;
}

/// Producer side, used by acquisition workers to append raw payloads.
pub trait MessagePublisher: Send + Sync {
    /// Append a payload and return its offset.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        partition: PartitionId,
        schema_id: Option<String>,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ClientError>> + Send + 'a>>;

    fn partitions(&self, topic: &str) -> Vec<PartitionId>;
}
