//! Payloads carried on each channel.
//!
//! `new_jobs`, `old_jobs` and `enriched` carry a bare [`JobDocument`].

use jobflow_core::{FeedSource, JobDocument, Record};
use serde::{Deserialize, Serialize};

/// `feeds`: one feed to download for the current run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedTask {
    pub source: FeedSource,
    pub process_seq: String,
}

impl FeedTask {
    pub fn message_key(&self) -> String {
        format!("{}-{}", self.source.name, self.source.order)
    }
}

/// `records`: one raw record as read from a feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub record: Record,
    pub feed_name: String,
    pub seq: u64,
}

impl RecordEnvelope {
    pub fn message_key(&self) -> String {
        format!("{}-{}", self.feed_name, self.seq)
    }
}

/// `normalized`: a listing with the classifier's result for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedJob {
    pub document: JobDocument,
    pub response: serde_json::Value,
}

/// Key for every channel carrying a listing.
pub fn document_key(doc: &JobDocument) -> String {
    format!("{}-{}", doc.id, doc.sequence)
}
