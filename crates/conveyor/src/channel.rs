//! Counted channels between stages.
//!
//! A channel is a queue topic plus three counters in the shared store:
//! `produced` (bumped before the publish), `consumed` (bumped when an ack
//! retires an outstanding delivery) and `cached` (bumped when a stage holds
//! a delivery in a buffer). Because `consumed` only moves on a successful
//! ack of an outstanding message, it can never overtake `produced`.
//!
//! The producer flag is derived from an in-flight counter: `Running` while
//! any producer is between `begin_producing` and `end_producing`, `Done` once
//! one has started and none remain.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jobflow_core::{Counter, StoreKeys};
use jobflow_queue::{MessageQueue, SharedStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::ConveyorError;
use crate::message::Message;
use crate::reports::publish_error;
use crate::topics::ChannelName;

/// Snapshot of a channel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCounts {
    pub produced: i64,
    pub consumed: i64,
    pub cached: i64,
}

impl ChannelCounts {
    pub fn is_drained(&self) -> bool {
        self.consumed >= self.produced
    }
}

impl fmt::Display for ChannelCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.produced, self.consumed, self.cached)
    }
}

/// Whether upstream enumeration into a channel has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProducerState {
    NotStarted,
    Running,
    Done,
}

const STARTED: &str = "started";

/// A message taken off a channel and not yet acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub receipt_handle: String,
    /// 1 on first delivery.
    pub attempt: u32,
}

#[derive(Clone)]
pub struct Channel {
    name: ChannelName,
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish()
    }
}

impl Channel {
    pub fn new(
        name: ChannelName,
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn SharedStore>,
        keys: StoreKeys,
    ) -> Self {
        Self {
            name,
            queue,
            store,
            keys,
        }
    }

    pub fn name(&self) -> ChannelName {
        self.name
    }

    fn counter_key(&self, counter: Counter) -> String {
        self.keys.channel_counter(self.name.as_str(), counter)
    }

    /// Publish `payload` under `key` and count it as produced.
    #[instrument(skip(self, payload), fields(channel = %self.name))]
    pub async fn produce<T: Serialize + ?Sized>(
        &self,
        key: &str,
        payload: &T,
    ) -> Result<(), ConveyorError> {
        let bytes = Message::new(self.name.as_str(), key, payload)?.to_bytes()?;
        // Counted first so a fast consumer can never ack ahead of the count.
        self.store.incr(&self.counter_key(Counter::Produced)).await?;
        if let Err(e) = self.queue.publish(self.name.as_str(), key, bytes).await {
            // `produced` stays ahead for the rest of the run; the channel cannot drain.
            warn!(channel = %self.name, key, error = %e, "publish failed after counting");
            self.store
                .incr(&self.keys.report(&publish_error(self.name.as_str())))
                .await?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Wait up to `wait` for the next delivery.
    ///
    /// An envelope that cannot be decoded is acked (and so counted consumed)
    /// and dropped; `None` is returned in its place.
    pub async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, ConveyorError> {
        let Some(raw) = self.queue.poll(self.name.as_str(), wait).await? else {
            return Ok(None);
        };
        match Message::from_bytes(&raw.body) {
            Ok(message) => Ok(Some(Delivery {
                message,
                receipt_handle: raw.receipt_handle,
                attempt: raw.attempt_count,
            })),
            Err(e) => {
                warn!(
                    channel = %self.name,
                    key = %raw.key,
                    error = %e,
                    "undecodable envelope dropped"
                );
                self.settle(&raw.receipt_handle).await?;
                Ok(None)
            }
        }
    }

    /// Acknowledge a delivery. Returns `false` when it was no longer outstanding
    /// (already acked, or the topic was reset since); `consumed` is untouched then.
    pub async fn ack(&self, delivery: &Delivery) -> Result<bool, ConveyorError> {
        self.settle(&delivery.receipt_handle).await
    }

    async fn settle(&self, receipt_handle: &str) -> Result<bool, ConveyorError> {
        let outstanding = self.queue.ack(self.name.as_str(), receipt_handle).await?;
        if outstanding {
            self.store.incr(&self.counter_key(Counter::Consumed)).await?;
        } else {
            debug!(channel = %self.name, receipt_handle, "late ack ignored");
        }
        Ok(outstanding)
    }

    /// Hand the delivery back to the queue for redelivery.
    pub async fn nack(&self, delivery: &Delivery) -> Result<(), ConveyorError> {
        self.queue
            .nack(self.name.as_str(), &delivery.receipt_handle)
            .await?;
        Ok(())
    }

    /// Count a delivery that a stage is holding instead of forwarding.
    pub async fn mark_cached(&self, _delivery: &Delivery) -> Result<(), ConveyorError> {
        self.store.incr(&self.counter_key(Counter::Cached)).await?;
        Ok(())
    }

    /// Mark one producer as enumerating into this channel.
    pub async fn begin_producing(&self) -> Result<(), ConveyorError> {
        self.store.incr(&self.inflight_key()).await?;
        self.store.set(&self.started_key(), STARTED).await?;
        Ok(())
    }

    /// Mark one producer as finished. Pair with `begin_producing`, also on failure.
    pub async fn end_producing(&self) -> Result<(), ConveyorError> {
        self.store.incr_by(&self.inflight_key(), -1).await?;
        Ok(())
    }

    pub async fn producer_state(&self) -> Result<ProducerState, ConveyorError> {
        if self.store.get_i64(&self.inflight_key()).await? > 0 {
            return Ok(ProducerState::Running);
        }
        let started = self.store.get(&self.started_key()).await?;
        Ok(match started.as_deref() {
            Some(STARTED) => ProducerState::Done,
            _ => ProducerState::NotStarted,
        })
    }

    fn inflight_key(&self) -> String {
        self.keys.producer_inflight(self.name.as_str())
    }

    fn started_key(&self) -> String {
        self.keys.producer_state(self.name.as_str())
    }

    pub async fn produced(&self) -> Result<i64, ConveyorError> {
        Ok(self.store.get_i64(&self.counter_key(Counter::Produced)).await?)
    }

    pub async fn consumed(&self) -> Result<i64, ConveyorError> {
        Ok(self.store.get_i64(&self.counter_key(Counter::Consumed)).await?)
    }

    pub async fn cached(&self) -> Result<i64, ConveyorError> {
        Ok(self.store.get_i64(&self.counter_key(Counter::Cached)).await?)
    }

    pub async fn counts(&self) -> Result<ChannelCounts, ConveyorError> {
        Ok(ChannelCounts {
            produced: self.produced().await?,
            consumed: self.consumed().await?,
            cached: self.cached().await?,
        })
    }

    /// Drop every queued message and zero the counters. SETUP only.
    #[instrument(skip(self), fields(channel = %self.name))]
    pub async fn reset(&self) -> Result<(), ConveyorError> {
        self.queue.purge(self.name.as_str()).await?;
        for counter in [Counter::Produced, Counter::Consumed, Counter::Cached] {
            self.store.set(&self.counter_key(counter), "0").await?;
        }
        self.store.set(&self.inflight_key(), "0").await?;
        self.store.set(&self.started_key(), "").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reports::Reports;
    use jobflow_queue::{MemoryQueue, MemoryStore, QueueError, QueueHealth, QueueMessage};

    fn channel(name: ChannelName) -> Channel {
        Channel::new(
            name,
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryStore::new()),
            StoreKeys::new("test"),
        )
    }

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn produce_consume_ack_counts() {
        let ch = channel(ChannelName::Records);
        ch.produce("a-1", &1u32).await.unwrap();
        ch.produce("a-2", &2u32).await.unwrap();

        let d = ch.consume(WAIT).await.unwrap().unwrap();
        assert_eq!(d.message.key, "a-1");
        assert_eq!(d.message.decode::<u32>().unwrap(), 1);
        assert!(ch.ack(&d).await.unwrap());

        let counts = ch.counts().await.unwrap();
        assert_eq!(counts, ChannelCounts { produced: 2, consumed: 1, cached: 0 });
        assert!(!counts.is_drained());
    }

    #[tokio::test]
    async fn duplicate_ack_does_not_overcount() {
        let ch = channel(ChannelName::Records);
        ch.produce("k", &()).await.unwrap();
        let d = ch.consume(WAIT).await.unwrap().unwrap();
        assert!(ch.ack(&d).await.unwrap());
        assert!(!ch.ack(&d).await.unwrap());
        assert_eq!(ch.consumed().await.unwrap(), 1);
        assert!(ch.counts().await.unwrap().is_drained());
    }

    #[tokio::test]
    async fn nack_redelivers_without_counting() {
        let ch = channel(ChannelName::NewJobs);
        ch.produce("k", &"x").await.unwrap();
        let d = ch.consume(WAIT).await.unwrap().unwrap();
        ch.nack(&d).await.unwrap();
        let again = ch.consume(WAIT).await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        assert_eq!(ch.consumed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reset_purges_and_zeroes() {
        let ch = channel(ChannelName::Feeds);
        ch.begin_producing().await.unwrap();
        ch.produce("k", &1u8).await.unwrap();
        let stale = ch.consume(WAIT).await.unwrap().unwrap();
        ch.mark_cached(&stale).await.unwrap();

        ch.reset().await.unwrap();
        assert_eq!(ch.counts().await.unwrap(), ChannelCounts::default());
        assert_eq!(ch.producer_state().await.unwrap(), ProducerState::NotStarted);
        assert!(ch.consume(WAIT).await.unwrap().is_none());
        // An ack from before the reset must not leak into the new run.
        assert!(!ch.ack(&stale).await.unwrap());
        assert_eq!(ch.consumed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn producer_lifecycle() {
        let ch = channel(ChannelName::Feeds);
        assert_eq!(ch.producer_state().await.unwrap(), ProducerState::NotStarted);
        ch.begin_producing().await.unwrap();
        assert_eq!(ch.producer_state().await.unwrap(), ProducerState::Running);
        ch.end_producing().await.unwrap();
        assert_eq!(ch.producer_state().await.unwrap(), ProducerState::Done);
    }

    #[tokio::test]
    async fn running_while_any_producer_is_in_flight() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let keys = StoreKeys::new("t");
        let a = Channel::new(ChannelName::Records, queue.clone(), store.clone(), keys.clone());
        let b = Channel::new(ChannelName::Records, queue, store, keys);

        a.begin_producing().await.unwrap();
        b.begin_producing().await.unwrap();
        a.end_producing().await.unwrap();
        assert_eq!(b.producer_state().await.unwrap(), ProducerState::Running);

        b.end_producing().await.unwrap();
        assert_eq!(a.producer_state().await.unwrap(), ProducerState::Done);
    }

    struct RejectingQueue(MemoryQueue);

    #[async_trait::async_trait]
    impl MessageQueue for RejectingQueue {
        async fn publish(&self, _: &str, _: &str, _: Vec<u8>) -> Result<(), QueueError> {
            Err(QueueError::Connection("broker gone".into()))
        }
        async fn poll(
            &self,
            topic: &str,
            wait: Duration,
        ) -> Result<Option<QueueMessage>, QueueError> {
            self.0.poll(topic, wait).await
        }
        async fn ack(&self, topic: &str, handle: &str) -> Result<bool, QueueError> {
            self.0.ack(topic, handle).await
        }
        async fn nack(&self, topic: &str, handle: &str) -> Result<(), QueueError> {
            self.0.nack(topic, handle).await
        }
        async fn purge(&self, topic: &str) -> Result<(), QueueError> {
            self.0.purge(topic).await
        }
        async fn health_check(&self) -> Result<QueueHealth, QueueError> {
            self.0.health_check().await
        }
    }

    #[tokio::test]
    async fn failed_publish_is_reported_per_channel() {
        let store = Arc::new(MemoryStore::new());
        let keys = StoreKeys::new("t");
        let queue = Arc::new(RejectingQueue(MemoryQueue::new()));
        let ch = Channel::new(ChannelName::NewJobs, queue, store.clone(), keys.clone());

        assert!(ch.produce("k", &1u8).await.is_err());

        let counts = ch.counts().await.unwrap();
        assert_eq!(counts.produced, 1);
        assert!(!counts.is_drained());
        let reports = Reports::new(store, keys);
        assert_eq!(reports.get(&publish_error("new_jobs")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn garbage_body_is_dropped_and_counted() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let ch = Channel::new(ChannelName::Records, queue.clone(), store, StoreKeys::new("t"));
        queue.publish("records", "bad", vec![0xc1]).await.unwrap();

        assert!(ch.consume(WAIT).await.unwrap().is_none());
        assert_eq!(ch.consumed().await.unwrap(), 1);
    }
}
