pub mod channel;
pub mod context;
pub mod error;
pub mod message;
pub mod payloads;
pub mod readiness;
pub mod reports;
pub mod signal;
pub mod topics;
pub mod worker;

pub use channel::{Channel, ChannelCounts, Delivery, ProducerState};
pub use context::Conveyor;
pub use error::ConveyorError;
pub use message::Message;
pub use payloads::{document_key, FeedTask, NormalizedJob, RecordEnvelope};
pub use readiness::Readiness;
pub use reports::{log_discard, Reports};
pub use signal::shutdown_on_signal;
pub use topics::ChannelName;
pub use worker::{Disposition, Emitter, Route, Stage, StepOutcome, WorkerBuilder, WorkerLoop};
