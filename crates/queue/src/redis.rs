//! Redis-backed queue (streams + consumer groups) and shared store.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::redis;
use deadpool_redis::{Config, Pool, Runtime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consumer::{MessageQueue, QueueHealth, QueueMessage};
use crate::error::QueueError;
use crate::store::SharedStore;

const FIELD_KEY: &str = "key";
const FIELD_BODY: &str = "body";
const FIELD_ATTEMPT: &str = "attempt";

/// `XREADGROUP` reply: `[[stream, [[id, {field: value}]]]]`, nil on timeout.
type StreamReply = Option<Vec<(String, Vec<(String, HashMap<String, Vec<u8>>)>)>>;

pub fn create_pool(url: &str) -> Result<Pool, QueueError> {
    Config::from_url(url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| QueueError::Connection(e.to_string()))
}

/// Queue built on Redis streams.
///
/// Each topic is one stream with one consumer group shared by every worker
/// of the consuming stage. A receipt handle is the stream entry id.
pub struct RedisQueue {
    pool: Pool,
    namespace: String,
    group: String,
    consumer: String,
    groups_ready: Mutex<HashSet<String>>,
}

impl RedisQueue {
    pub fn new(pool: Pool, namespace: &str) -> Self {
        let consumer = Uuid::new_v4().to_string();
        info!(namespace, consumer = %consumer, "redis stream queue initialized");
        Self {
            pool,
            namespace: namespace.to_string(),
            group: format!("{namespace}:workers"),
            consumer,
            groups_ready: Mutex::new(HashSet::new()),
        }
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:stream:{}", self.namespace, topic)
    }

    async fn ensure_group(&self, stream: &str) -> Result<(), QueueError> {
        if self.groups_ready.lock().await.contains(stream) {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => debug!(stream, group = %self.group, "created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }
        self.groups_ready.lock().await.insert(stream.to_string());
        Ok(())
    }

    async fn read_one(
        &self,
        conn: &mut deadpool_redis::Connection,
        stream: &str,
        wait: Duration,
    ) -> Result<StreamReply, redis::RedisError> {
        redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(wait.as_millis().max(1) as u64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(conn)
            .await
    }
}

fn parse_attempt(fields: &HashMap<String, Vec<u8>>) -> u32 {
    fields
        .get(FIELD_ATTEMPT)
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn publish(&self, topic: &str, key: &str, body: Vec<u8>) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("XADD")
            .arg(self.stream_key(topic))
            .arg("*")
            .arg(FIELD_KEY)
            .arg(key)
            .arg(FIELD_BODY)
            .arg(body)
            .arg(FIELD_ATTEMPT)
            .arg(0)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn poll(&self, topic: &str, wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let stream = self.stream_key(topic);
        self.ensure_group(&stream).await?;

        let mut conn = self.pool.get().await?;
        let reply = match self.read_one(&mut conn, &stream, wait).await {
            Ok(reply) => reply,
            Err(e) if e.code() == Some("NOGROUP") => {
                // Stream was purged; the group goes with it.
                warn!(stream = %stream, "consumer group vanished, recreating");
                self.groups_ready.lock().await.remove(&stream);
                self.ensure_group(&stream).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let entry = reply
            .into_iter()
            .flatten()
            .flat_map(|(_, entries)| entries)
            .next();
        let Some((id, fields)) = entry else {
            return Ok(None);
        };

        let key = fields
            .get(FIELD_KEY)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();
        let attempt = parse_attempt(&fields);
        let body = fields
            .get(FIELD_BODY)
            .cloned()
            .ok_or_else(|| QueueError::Parse(format!("stream entry {id} has no body")))?;

        Ok(Some(QueueMessage {
            id: id.clone(),
            key,
            body,
            receipt_handle: id,
            timestamp: Utc::now(),
            attempt_count: attempt + 1,
        }))
    }

    async fn ack(&self, topic: &str, receipt_handle: &str) -> Result<bool, QueueError> {
        let mut conn = self.pool.get().await?;
        let acked: i64 = redis::cmd("XACK")
            .arg(self.stream_key(topic))
            .arg(&self.group)
            .arg(receipt_handle)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))?;
        Ok(acked == 1)
    }

    /// Re-append the entry with a bumped attempt count, then retire the original.
    async fn nack(&self, topic: &str, receipt_handle: &str) -> Result<(), QueueError> {
        let stream = self.stream_key(topic);
        let mut conn = self.pool.get().await?;
        let entries: Vec<(String, HashMap<String, Vec<u8>>)> = redis::cmd("XRANGE")
            .arg(&stream)
            .arg(receipt_handle)
            .arg(receipt_handle)
            .query_async(&mut conn)
            .await?;
        let Some((_, fields)) = entries.into_iter().next() else {
            return Ok(());
        };
        let attempt = parse_attempt(&fields) + 1;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg(FIELD_KEY)
            .arg(fields.get(FIELD_KEY).cloned().unwrap_or_default())
            .arg(FIELD_BODY)
            .arg(fields.get(FIELD_BODY).cloned().unwrap_or_default())
            .arg(FIELD_ATTEMPT)
            .arg(attempt)
            .ignore()
            .cmd("XACK")
            .arg(&stream)
            .arg(&self.group)
            .arg(receipt_handle)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn purge(&self, topic: &str) -> Result<(), QueueError> {
        let stream = self.stream_key(topic);
        let mut conn = self.pool.get().await?;
        let _: i64 = redis::cmd("DEL").arg(&stream).query_async(&mut conn).await?;
        self.groups_ready.lock().await.remove(&stream);
        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(QueueHealth {
            connected: true,
            provider: "redis".to_string(),
        })
    }
}

/// Shared store on plain Redis strings.
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, QueueError> {
        let mut conn = self.pool.get().await?;
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Store(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.pool.get().await?;
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, QueueError> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64, QueueError> {
        let mut conn = self.pool.get().await?;
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut removed = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            if !batch.is_empty() {
                let n: u64 = redis::cmd("DEL").arg(&batch).query_async(&mut conn).await?;
                removed += n;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_defaults_to_zero() {
        let fields = HashMap::new();
        assert_eq!(parse_attempt(&fields), 0);
    }

    #[test]
    fn attempt_parses_ascii() {
        let fields = HashMap::from([(FIELD_ATTEMPT.to_string(), b"3".to_vec())]);
        assert_eq!(parse_attempt(&fields), 3);
    }

    #[test]
    fn pool_from_url() {
        assert!(create_pool("redis://127.0.0.1:6379/0").is_ok());
    }
}
