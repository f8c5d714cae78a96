//! Sink stage: buffer enriched listings and write them to the document
//! store with bulk requests.
//!
//! A failed bulk request keeps the buffer and holds the input; the next
//! input or idle poll tries again. Items the store rejects one by one are
//! counted under `sink-error` and released with the rest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobflow_conveyor::reports::SINK_ERROR;
use jobflow_conveyor::{document_key, Disposition, Emitter, Reports, Stage};
use jobflow_core::JobDocument;
use jobflow_queue::MicroBatcher;
use tracing::{info, warn};

use crate::error::StageError;
use crate::index::DocumentStore;

pub struct SinkStage {
    store: Arc<dyn DocumentStore>,
    reports: Reports,
    batch: MicroBatcher<JobDocument>,
}

impl SinkStage {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        reports: Reports,
        batch_size: usize,
        idle_flush: Option<Duration>,
    ) -> Self {
        Self {
            store,
            reports,
            batch: MicroBatcher::new(batch_size, idle_flush),
        }
    }

    pub fn buffered(&self) -> usize {
        self.batch.len()
    }

    /// Write the buffer. Returns `false` and keeps it when the request failed.
    async fn flush(&mut self) -> bool {
        let size = self.batch.len();
        match self.store.bulk_upsert(self.batch.items()).await {
            Ok(summary) => {
                if summary.failed > 0 {
                    if let Err(e) = self.reports.incr_by(SINK_ERROR, summary.failed as i64).await {
                        warn!(error = %e, "failed to update error report");
                    }
                }
                info!(size, indexed = summary.indexed, failed = summary.failed, "batch written");
                self.batch.clear();
                true
            }
            Err(e) => {
                warn!(size, error = %e, "bulk write failed, keeping batch");
                false
            }
        }
    }
}

#[async_trait]
impl Stage for SinkStage {
    type Input = JobDocument;
    type Output = JobDocument;
    type Error = StageError;

    fn name(&self) -> &str {
        "sink"
    }

    fn message_key(&self, output: &JobDocument) -> String {
        document_key(output)
    }

    async fn process(
        &mut self,
        doc: JobDocument,
        _out: &mut Emitter<JobDocument>,
    ) -> Result<Disposition, StageError> {
        self.batch.push(doc);
        if !self.batch.is_full() {
            return Ok(Disposition::Held);
        }
        if self.flush().await {
            Ok(Disposition::Released)
        } else {
            Ok(Disposition::Held)
        }
    }

    async fn on_idle(&mut self, _out: &mut Emitter<JobDocument>) -> Result<bool, StageError> {
        if !self.batch.should_flush() {
            return Ok(false);
        }
        Ok(self.flush().await)
    }
}
