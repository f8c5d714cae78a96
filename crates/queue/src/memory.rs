//! In-process queue and store.
//!
//! Used by tests and by single-process deployments where every stage runs
//! inside one binary. Semantics match the Redis backends: competing
//! consumers per topic, outstanding messages until ack/nack, nack puts the
//! message back at the head of the topic.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::consumer::{MessageQueue, QueueHealth, QueueMessage};
use crate::error::QueueError;
use crate::store::SharedStore;

#[derive(Default)]
struct TopicState {
    pending: VecDeque<QueueMessage>,
    outstanding: HashMap<String, QueueMessage>,
}

#[derive(Default)]
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, TopicState>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting on `topic` (not counting outstanding ones).
    pub async fn pending_len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map_or(0, |t| t.pending.len())
    }

    /// Messages handed out on `topic` and not yet acked or nacked.
    pub async fn outstanding_len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map_or(0, |t| t.outstanding.len())
    }

    async fn try_take(&self, topic: &str) -> Option<QueueMessage> {
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_default();
        let mut msg = state.pending.pop_front()?;
        msg.attempt_count += 1;
        msg.receipt_handle = Uuid::new_v4().to_string();
        state
            .outstanding
            .insert(msg.receipt_handle.clone(), msg.clone());
        Some(msg)
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, topic: &str, key: &str, body: Vec<u8>) -> Result<(), QueueError> {
        let msg = QueueMessage {
            id: Uuid::new_v4().to_string(),
            key: key.to_string(),
            body,
            receipt_handle: String::new(),
            timestamp: Utc::now(),
            attempt_count: 0,
        };
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .pending
            .push_back(msg);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn poll(&self, topic: &str, wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.try_take(topic).await {
                return Ok(Some(msg));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, topic: &str, receipt_handle: &str) -> Result<bool, QueueError> {
        let mut topics = self.topics.lock().await;
        Ok(topics
            .get_mut(topic)
            .and_then(|t| t.outstanding.remove(receipt_handle))
            .is_some())
    }

    async fn nack(&self, topic: &str, receipt_handle: &str) -> Result<(), QueueError> {
        let mut topics = self.topics.lock().await;
        if let Some(state) = topics.get_mut(topic) {
            if let Some(msg) = state.outstanding.remove(receipt_handle) {
                state.pending.push_front(msg);
            }
        }
        drop(topics);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn purge(&self, topic: &str) -> Result<(), QueueError> {
        self.topics.lock().await.remove(topic);
        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        Ok(QueueHealth {
            connected: true,
            provider: "memory".to_string(),
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, QueueError> {
        let mut values = self.values.lock().await;
        let current = match values.get(key) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| QueueError::Store(format!("value at '{key}' is not an integer")))?,
            None => 0,
        };
        let next = current + delta;
        values.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), QueueError> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, QueueError> {
        let mut values = self.values.lock().await;
        if values.contains_key(key) {
            return Ok(false);
        }
        values.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64, QueueError> {
        let mut values = self.values.lock().await;
        let before = values.len();
        values.retain(|k, _| !k.starts_with(prefix));
        Ok((before - values.len()) as u64)
    }
}
