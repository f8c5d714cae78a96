use jobflow_conveyor::ConveyorError;
use jobflow_queue::QueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("conveyor error: {0}")]
    Conveyor(#[from] ConveyorError),

    #[error("store error: {0}")]
    Store(#[from] QueueError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed error: {0}")]
    Feed(String),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("document store error: {0}")]
    DocumentStore(String),

    #[error("no run token in the shared store")]
    MissingRunToken,
}
