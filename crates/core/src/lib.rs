pub mod config;
pub mod document;
pub mod error;
pub mod keys;
pub mod pipeline_file;

pub use config::Config;
pub use document::*;
pub use error::*;
pub use keys::{Counter, StoreKeys};
pub use pipeline_file::{FeedKind, FeedSource, PipelineFile};
