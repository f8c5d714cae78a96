//! The five pipeline stages and the external services they talk to.

pub mod classifier;
pub mod clean;
pub mod enrich;
pub mod error;
pub mod feeds;
pub mod fetch;
pub mod identity;
pub mod index;
pub mod normalize;
pub mod sink;

pub use classifier::{Classifier, ClassifierReply, ClassifierRequest, HttpClassifier, RetryBudget};
pub use clean::CleanStage;
pub use enrich::EnrichStage;
pub use error::StageError;
pub use feeds::FeedParser;
pub use fetch::{FeedReader, FetchStage, HttpFeedReader};
pub use identity::{Identity, IdentityResolver, StoreIdentity};
pub use index::{BulkSummary, CleanupSummary, DocumentStore, OpenSearchStore};
pub use normalize::BatchRetryProcessor;
pub use sink::SinkStage;
