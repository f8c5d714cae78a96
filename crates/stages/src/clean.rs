//! Clean stage: map raw records onto listing fields and route new vs. seen.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jobflow_conveyor::reports::clean_error;
use jobflow_conveyor::{
    document_key, log_discard, Disposition, Emitter, RecordEnvelope, Reports, Route, Stage,
};
use jobflow_core::{FeedSource, JobDocument, LISTING_HASH_FIELD};
use serde_json::Value;
use tracing::debug;

use crate::error::StageError;
use crate::feeds::FeedParser;
use crate::identity::{listing_hash, IdentityResolver};

pub struct CleanStage {
    parsers: HashMap<String, FeedParser>,
    identity: Arc<dyn IdentityResolver>,
    reports: Reports,
}

impl CleanStage {
    pub fn new(
        feeds: &[FeedSource],
        desc_max_len: usize,
        identity: Arc<dyn IdentityResolver>,
        reports: Reports,
    ) -> Self {
        let parsers = feeds
            .iter()
            .map(|f| (f.name.clone(), FeedParser::new(f.kind, desc_max_len)))
            .collect();
        Self {
            parsers,
            identity,
            reports,
        }
    }
}

#[async_trait]
impl Stage for CleanStage {
    type Input = RecordEnvelope;
    type Output = JobDocument;
    type Error = StageError;

    fn name(&self) -> &str {
        "clean"
    }

    fn message_key(&self, output: &JobDocument) -> String {
        document_key(output)
    }

    async fn process(
        &mut self,
        input: RecordEnvelope,
        out: &mut Emitter<JobDocument>,
    ) -> Result<Disposition, StageError> {
        let feed = input.feed_name.as_str();
        let Some(parser) = self.parsers.get(feed) else {
            self.reports.incr(&clean_error(feed)).await?;
            log_discard(&input.message_key(), feed, "unsupported feed");
            return Ok(Disposition::Complete);
        };

        let mut fields = match parser.parse(&input.record) {
            Ok(fields) => fields,
            Err(failure) => {
                self.reports.incr(&clean_error(feed)).await?;
                let job_id = failure
                    .fields
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                log_discard(job_id, feed, &failure.errors.join(", "));
                return Ok(Disposition::Complete);
            }
        };

        let identity = self.identity.identify(&fields).await?;
        if !fields.contains_key(LISTING_HASH_FIELD) {
            let hash = listing_hash(&fields);
            fields.insert(LISTING_HASH_FIELD.to_string(), Value::String(hash));
        }

        let doc = JobDocument::new(identity.id, fields, feed, input.seq);
        debug!(job_id = %doc.id, feed, is_new = identity.is_new, "cleaned");
        if identity.is_new {
            out.emit(doc);
        } else {
            out.emit_to(Route::Secondary, doc);
        }
        Ok(Disposition::Complete)
    }
}
