use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use ingest_api::broker::{BrokerClient, MessagePublisher, SubscriptionHandle};
use ingest_api::{ClientError, MessageRef, PartitionId, RawMessage};

// ═══════════════════════════════════════════════════════════════
//  MemoryBrokerConfig
// ═══════════════════════════════════════════════════════════════

fn default_ack_deadline_ms() -> u64 {
    60_000
}

fn default_redelivery_delay_ms() -> u64 {
    1_000
}

fn default_partitions() -> u32 {
    1
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MemoryBrokerConfig {
    /// Unacknowledged deliveries older than this are redelivered.
    #[serde(default = "default_ack_deadline_ms")]
    pub ack_deadline_ms: u64,
    /// Delay before a nacked message becomes deliverable again.
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
    /// Partitions created per topic on first use.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            ack_deadline_ms: default_ack_deadline_ms(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
            partitions: default_partitions(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Partition log
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq)]
enum Delivery {
    /// Deliverable once `available_at` has passed (`None` = immediately).
    Pending { available_at: Option<Instant> },
    InFlight { deadline: Instant },
    Acked,
}

struct Entry {
    schema_id: Option<String>,
    payload: Vec<u8>,
    enqueue_time_ms: i64,
    attempts: u32,
    delivery: Delivery,
}

#[derive(Default)]
struct LogState {
    /// Offset of `entries[0]`. Fully acked prefixes are dropped.
    base_offset: u64,
    entries: VecDeque<Entry>,
}

impl LogState {
    fn entry_mut(&mut self, offset: u64) -> Option<&mut Entry> {
        let idx = offset.checked_sub(self.base_offset)?;
        self.entries.get_mut(idx as usize)
    }

    fn trim_acked_prefix(&mut self) {
        while matches!(self.entries.front(), Some(e) if e.delivery == Delivery::Acked) {
            self.entries.pop_front();
            self.base_offset += 1;
        }
    }

    /// Take the lowest-offset deliverable entry. When nothing is deliverable,
    /// returns the earliest instant at which something becomes deliverable.
    fn take_next(&mut self, now: Instant, ack_deadline: Duration) -> Result<(u64, &Entry), Option<Instant>> {
        let mut wake: Option<Instant> = None;
        let mut found = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            let ready_at = match entry.delivery {
                Delivery::Pending { available_at } => available_at,
                Delivery::InFlight { deadline } => Some(deadline),
                Delivery::Acked => continue,
            };
            match ready_at {
                Some(at) if at > now => {
                    wake = Some(wake.map_or(at, |w| w.min(at)));
                }
                _ => {
                    found = Some(idx);
                    break;
                }
            }
        }

        let idx = found.ok_or(wake)?;
        let entry = &mut self.entries[idx];
        entry.attempts += 1;
        entry.delivery = Delivery::InFlight { deadline: now + ack_deadline };
        Ok((self.base_offset + idx as u64, &self.entries[idx]))
    }

    fn unacked(&self) -> u64 {
        self.entries.iter().filter(|e| e.delivery != Delivery::Acked).count() as u64
    }
}

struct PartitionLog {
    state: Mutex<LogState>,
    notify: Notify,
}

impl PartitionLog {
    fn new() -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBroker
// ═══════════════════════════════════════════════════════════════

/// In-process partitioned log with at-least-once delivery.
///
/// Deliveries always pick the lowest deliverable offset, so a nacked or
/// expired message is handed out again before anything newer in its partition.
pub struct MemoryBroker {
    logs: Mutex<HashMap<(String, PartitionId), Arc<PartitionLog>>>,
    config: MemoryBrokerConfig,
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Build from the `[broker]` section options.
    pub fn from_options(options: &serde_json::Value) -> Result<Self, ClientError> {
        let config: MemoryBrokerConfig = serde_json::from_value(options.clone())
            .map_err(|e| ClientError::config(format!("memory broker config: {e}")))?;
        Ok(Self::new(config))
    }

    fn log(&self, topic: &str, partition: PartitionId) -> Arc<PartitionLog> {
        let mut logs = self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        logs.entry((topic.to_string(), partition))
            .or_insert_with(|| Arc::new(PartitionLog::new()))
            .clone()
    }

    fn ack_deadline(&self) -> Duration {
        Duration::from_millis(self.config.ack_deadline_ms)
    }

    fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.config.redelivery_delay_ms)
    }

    /// Append a message synchronously. Returns its offset.
    pub fn append(
        &self,
        topic: &str,
        partition: PartitionId,
        schema_id: Option<String>,
        payload: Vec<u8>,
    ) -> u64 {
        let log = self.log(topic, partition);
        let offset = {
            let mut state = log.lock();
            state.entries.push_back(Entry {
                schema_id,
                payload,
                enqueue_time_ms: ingest_api::now_ms(),
                attempts: 0,
                delivery: Delivery::Pending { available_at: None },
            });
            state.base_offset + state.entries.len() as u64 - 1
        };
        log.notify.notify_one();
        offset
    }

    fn resolve(&self, msg: &MessageRef, nack: bool) -> Result<(), ClientError> {
        let log = self.log(&msg.topic, msg.partition);
        {
            let mut state = log.lock();
            if msg.offset < state.base_offset {
                // Already acked and trimmed.
                return Ok(());
            }
            let redelivery = Instant::now() + self.redelivery_delay();
            let entry = state.entry_mut(msg.offset).ok_or_else(|| {
                ClientError::logic(format!(
                    "{}/{}: unknown offset {}",
                    msg.topic, msg.partition, msg.offset
                ))
            })?;
            match (entry.delivery, nack) {
                (Delivery::Acked, _) => return Ok(()),
                (_, false) => entry.delivery = Delivery::Acked,
                (Delivery::InFlight { .. }, true) if entry.attempts == msg.delivery_attempt => {
                    entry.delivery = Delivery::Pending { available_at: Some(redelivery) };
                }
                // Stale nack for a delivery that already expired or was redelivered.
                (_, true) => return Ok(()),
            }
            state.trim_acked_prefix();
        }
        if nack {
            log.notify.notify_one();
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

impl BrokerClient for MemoryBroker {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        partition: PartitionId,
    ) -> Pin<Box<dyn Future<Output = Result<SubscriptionHandle, ClientError>> + Send + 'a>> {
        Box::pin(async move {
            self.log(topic, partition);
            tracing::debug!(topic, partition, "memory broker subscription");
            Ok(SubscriptionHandle {
                topic: topic.to_string(),
                partition,
            })
        })
    }

    fn receive<'a>(
        &'a self,
        handle: &'a SubscriptionHandle,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RawMessage>, ClientError>> + Send + 'a>> {
        Box::pin(async move {
            let log = self.log(&handle.topic, handle.partition);
            let give_up = Instant::now() + timeout;
            loop {
                let now = Instant::now();
                let wake = {
                    let mut state = log.lock();
                    match state.take_next(now, self.ack_deadline()) {
                        Ok((offset, entry)) => {
                            return Ok(Some(RawMessage {
                                topic: handle.topic.clone(),
                                partition: handle.partition,
                                offset,
                                delivery_attempt: entry.attempts,
                                enqueue_time_ms: entry.enqueue_time_ms,
                                schema_id: entry.schema_id.clone(),
                                payload: entry.payload.clone(),
                            }));
                        }
                        Err(wake) => wake,
                    }
                };
                if now >= give_up {
                    return Ok(None);
                }
                let sleep_until = wake.map_or(give_up, |w| w.min(give_up));
                tokio::select! {
                    _ = log.notify.notified() => {}
                    _ = tokio::time::sleep_until(sleep_until) => {}
                }
            }
        })
    }

    fn ack<'a>(
        &'a self,
        msg: &'a MessageRef,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>> {
        Box::pin(async move { self.resolve(msg, false) })
    }

    fn nack<'a>(
        &'a self,
        msg: &'a MessageRef,
    ) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>> {
        Box::pin(async move { self.resolve(msg, true) })
    }

    fn lag<'a>(
        &'a self,
        handle: &'a SubscriptionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ClientError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.log(&handle.topic, handle.partition).lock().unacked()) })
    }
}

impl MessagePublisher for MemoryBroker {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        partition: PartitionId,
        schema_id: Option<String>,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ClientError>> + Send + 'a>> {
        Box::pin(async move {
            if partition >= self.config.partitions {
                return Err(ClientError::config(format!(
                    "topic '{topic}' has {} partitions, got partition {partition}",
                    self.config.partitions
                )));
            }
            Ok(self.append(topic, partition, schema_id, payload))
        })
    }

    fn partitions(&self, _topic: &str) -> Vec<PartitionId> {
        (0..self.config.partitions).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> MemoryBroker {
        MemoryBroker::new(MemoryBrokerConfig {
            ack_deadline_ms: 5_000,
            redelivery_delay_ms: 100,
            partitions: 2,
        })
    }

    async fn recv(broker: &MemoryBroker, handle: &SubscriptionHandle) -> RawMessage {
        broker
            .receive(handle, Duration::from_secs(1))
            .await
            .expect("receive")
            .expect("message")
    }

    #[tokio::test]
    async fn delivers_in_offset_order() {
        let broker = broker();
        for i in 0..3u8 {
            broker.append("quotes", 0, Some("quote".into()), vec![i]);
        }
        let handle = broker.subscribe("quotes", 0).await.unwrap();

        for expected in 0..3u64 {
            let msg = recv(&broker, &handle).await;
            assert_eq!(msg.offset, expected);
            assert_eq!(msg.delivery_attempt, 1);
            assert_eq!(msg.schema_id.as_deref(), Some("quote"));
        }
        let none = broker.receive(&handle, Duration::from_millis(10)).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nack_redelivers_before_newer_messages() {
        let broker = broker();
        broker.append("quotes", 0, None, b"a".to_vec());
        broker.append("quotes", 0, None, b"b".to_vec());
        let handle = broker.subscribe("quotes", 0).await.unwrap();

        let first = recv(&broker, &handle).await;
        broker.nack(&first.message_ref()).await.unwrap();

        // Offset 1 is deliverable while offset 0 waits out the redelivery delay.
        let second = recv(&broker, &handle).await;
        assert_eq!(second.offset, 1);

        let again = recv(&broker, &handle).await;
        assert_eq!(again.offset, 0);
        assert_eq!(again.delivery_attempt, 2);
        assert!(again.is_redelivery());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_delivery_expires_after_deadline() {
        let broker = broker();
        broker.append("quotes", 1, None, b"x".to_vec());
        let handle = broker.subscribe("quotes", 1).await.unwrap();

        let first = recv(&broker, &handle).await;
        assert!(broker.receive(&handle, Duration::from_secs(1)).await.unwrap().is_none());

        let redelivered = broker
            .receive(&handle, Duration::from_secs(10))
            .await
            .unwrap()
            .expect("redelivered after deadline");
        assert_eq!(redelivered.offset, first.offset);
        assert_eq!(redelivered.delivery_attempt, 2);
    }

    #[tokio::test]
    async fn lag_counts_unacked_messages() {
        let broker = broker();
        let handle = broker.subscribe("quotes", 0).await.unwrap();
        for _ in 0..4 {
            broker.append("quotes", 0, None, Vec::new());
        }
        assert_eq!(broker.lag(&handle).await.unwrap(), 4);

        let a = recv(&broker, &handle).await;
        let b = recv(&broker, &handle).await;
        broker.ack(&a.message_ref()).await.unwrap();
        broker.nack(&b.message_ref()).await.unwrap();
        assert_eq!(broker.lag(&handle).await.unwrap(), 3);

        // Acking twice is harmless.
        broker.ack(&a.message_ref()).await.unwrap();
        assert_eq!(broker.lag(&handle).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn publish_rejects_unknown_partition() {
        let broker = broker();
        assert_eq!(broker.partitions("quotes"), vec![0, 1]);
        let err = broker.publish("quotes", 7, None, Vec::new()).await.unwrap_err();
        assert_eq!(err.kind, ingest_api::ErrorKind::Config);
    }
}
