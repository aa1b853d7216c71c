use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use ingest_api::broker::{BrokerClient, SubscriptionHandle};
use ingest_api::{ClientError, PartitionId, RawMessage};

use crate::metrics::PipelineMetrics;

/// One unit of the partition's in-flight budget. Released on drop, i.e. when
/// the message has been acked or nacked (or abandoned at shutdown).
#[derive(Debug)]
pub struct InFlightPermit(Option<OwnedSemaphorePermit>);

impl InFlightPermit {
    /// A permit not tied to any budget.
    pub fn untracked() -> Self {
        Self(None)
    }
}

/// A received message together with its in-flight permit.
#[derive(Debug)]
pub struct Delivery {
    pub message: RawMessage,
    pub permit: InFlightPermit,
}

/// Pulls messages from one broker partition.
///
/// At most `max_in_flight` messages are outstanding at once; [`poll`] waits
/// for a permit before asking the broker for more. Redeliveries are passed
/// through as-is. Deduplication happens at the store.
///
/// [`poll`]: PartitionConsumer::poll
pub struct PartitionConsumer {
    broker: Arc<dyn BrokerClient>,
    handle: SubscriptionHandle,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
    poll_timeout: Duration,
    /// Highest offset seen so far.
    high_water: Option<u64>,
    metrics: Arc<PipelineMetrics>,
}

impl PartitionConsumer {
    pub async fn subscribe(
        broker: Arc<dyn BrokerClient>,
        topic: &str,
        partition: PartitionId,
        max_in_flight: usize,
        poll_timeout: Duration,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, ClientError> {
        let handle = broker
            .subscribe(topic, partition)
            .await
            .map_err(|e| e.with_context(format!("subscribe {topic}/{partition}")))?;
        tracing::info!(topic, partition, max_in_flight, "subscribed to partition");
        Ok(Self {
            broker,
            handle,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            poll_timeout,
            high_water: None,
            metrics,
        })
    }

    pub fn partition(&self) -> PartitionId {
        self.handle.partition
    }

    /// Messages received but not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.in_flight.available_permits()
    }

    /// Next message in broker order, or `None` when the poll timeout elapsed.
    ///
    /// Cancel-safe as long as the broker's `receive` is.
    pub async fn poll(&mut self) -> Result<Option<Delivery>, ClientError> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::logic("in-flight budget closed"))?;

        let Some(message) = self.broker.receive(&self.handle, self.poll_timeout).await? else {
            return Ok(None);
        };

        self.metrics.record_received(message.is_redelivery());
        if message.is_redelivery() {
            tracing::debug!(
                partition = message.partition,
                offset = message.offset,
                attempt = message.delivery_attempt,
                "redelivered message"
            );
        }
        self.high_water = Some(self.high_water.map_or(message.offset, |h| h.max(message.offset)));

        Ok(Some(Delivery {
            message,
            permit: InFlightPermit(Some(permit)),
        }))
    }

    pub fn high_water(&self) -> Option<u64> {
        self.high_water
    }

    /// Unacknowledged messages in the partition, as reported by the broker.
    pub async fn lag(&self) -> Result<u64, ClientError> {
        self.broker.lag(&self.handle).await
    }
}
