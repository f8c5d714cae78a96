pub mod batcher;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod redis;
pub mod store;

pub use batcher::MicroBatcher;
pub use consumer::{MessageQueue, QueueHealth, QueueMessage};
pub use error::QueueError;
pub use memory::{MemoryQueue, MemoryStore};
pub use redis::{RedisQueue, RedisStore};
pub use store::SharedStore;
