use jobflow_queue::QueueError;
use thiserror::Error;

/// Errors raised by channels and the worker loop.
#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("stage {stage} failed to initialize: {reason}")]
    Init { stage: String, reason: String },

    #[error("config error: {0}")]
    Config(String),
}
