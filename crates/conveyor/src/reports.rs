//! Named error counters and discard logging.
//!
//! Counters live under the run prefix, so they start from zero every run.

use std::sync::Arc;

use jobflow_core::StoreKeys;
use jobflow_queue::SharedStore;
use serde_json::json;
use tracing::debug;

use crate::error::ConveyorError;

/// Whole classifier batches lost (retry exhaustion or shape mismatch), counted per job.
pub const NORM_ERROR: &str = "norm-error";
/// Single jobs the classifier flagged with an error.
pub const NORM_ITEM_ERROR: &str = "norm-item-error";
/// Classifier batches lost, counted per batch.
pub const NORM_BATCH_ERROR: &str = "norm-batch-error";
pub const ENRICH_INVALID: &str = "enrich-invalid";
pub const SINK_ERROR: &str = "sink-error";

/// `publish-error:{channel}`: messages counted as produced but never published.
pub fn publish_error(channel: &str) -> String {
    format!("publish-error:{channel}")
}

/// `clean-error:{feed}`.
pub fn clean_error(feed: &str) -> String {
    format!("clean-error:{feed}")
}

#[derive(Clone)]
pub struct Reports {
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
}

impl Reports {
    pub fn new(store: Arc<dyn SharedStore>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    pub async fn incr(&self, name: &str) -> Result<i64, ConveyorError> {
        self.incr_by(name, 1).await
    }

    pub async fn incr_by(&self, name: &str, n: i64) -> Result<i64, ConveyorError> {
        Ok(self.store.incr_by(&self.keys.report(name), n).await?)
    }

    pub async fn get(&self, name: &str) -> Result<i64, ConveyorError> {
        Ok(self.store.get_i64(&self.keys.report(name)).await?)
    }
}

/// One log entry per dropped input message.
pub fn log_discard(job_id: &str, feed: &str, reason: &str) {
    let entry = json!({ "jobId": job_id, "feed": feed, "reason": reason });
    debug!(target: "jobflow::discard", %entry, "message discarded");
}
