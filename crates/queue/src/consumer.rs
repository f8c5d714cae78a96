//! Durable queue trait and types.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// A raw message received from a queue topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Provider message identifier.
    pub id: String,
    /// Producer-supplied message key (logical identity + sequence).
    pub key: String,
    /// Encoded message body.
    pub body: Vec<u8>,
    /// Provider-specific handle for ack/nack.
    pub receipt_handle: String,
    /// When the message was published.
    pub timestamp: DateTime<Utc>,
    /// Number of times this message has been delivered.
    pub attempt_count: u32,
}

/// Health status of a queue connection.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub connected: bool,
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueHealth {{ connected: {}, provider: {} }}",
            self.connected, self.provider
        )
    }
}

/// Topic-addressed queue with at-least-once delivery.
///
/// Every worker of one stage competes for the same topic; a message handed
/// out by `poll` stays outstanding until it is acked or nacked.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Append a message to `topic`.
    async fn publish(&self, topic: &str, key: &str, body: Vec<u8>) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next message. `None` when nothing arrived.
    async fn poll(&self, topic: &str, wait: Duration) -> Result<Option<QueueMessage>, QueueError>;

    /// Acknowledge successful processing.
    ///
    /// Returns `true` only if the message was still outstanding, so a late or
    /// repeated acknowledgement can be told apart from the first one.
    async fn ack(&self, topic: &str, receipt_handle: &str) -> Result<bool, QueueError>;

    /// Negative-acknowledge: make the message available for redelivery.
    async fn nack(&self, topic: &str, receipt_handle: &str) -> Result<(), QueueError>;

    /// Drop every pending and outstanding message on `topic`.
    async fn purge(&self, topic: &str) -> Result<(), QueueError>;

    /// Check queue connectivity.
    async fn health_check(&self) -> Result<QueueHealth, QueueError>;
}
