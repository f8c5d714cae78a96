use jobflow_conveyor::ConveyorError;
use jobflow_queue::QueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("conveyor error: {0}")]
    Conveyor(#[from] ConveyorError),

    #[error("store error: {0}")]
    Store(#[from] QueueError),

    #[error("no active run")]
    NoRun,
}
