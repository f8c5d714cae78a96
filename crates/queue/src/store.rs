//! Shared store used for cross-process coordination.

use async_trait::async_trait;

use crate::error::QueueError;

/// Key/value store shared by the controller and every worker process.
///
/// Counters must only be changed through [`SharedStore::incr_by`]; workers
/// never read a value, modify it locally and write it back.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically add `delta` to the integer at `key` (missing = 0) and return the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, QueueError>;

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), QueueError>;

    /// Set `key` only if it does not exist. Returns `true` when this call created it.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, QueueError>;

    /// Delete every key starting with `prefix`. Returns the number removed.
    async fn clear_prefix(&self, prefix: &str) -> Result<u64, QueueError>;

    async fn incr(&self, key: &str) -> Result<i64, QueueError> {
        self.incr_by(key, 1).await
    }

    /// Integer at `key`, 0 when missing or unparsable.
    async fn get_i64(&self, key: &str) -> Result<i64, QueueError> {
        Ok(self
            .get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}
