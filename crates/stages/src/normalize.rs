//! Normalize stage: classify listings in fixed-size batches.
//!
//! Listings accumulate in a buffer owned by this worker. Below the batch
//! size an input is held (counted `cached`, left unacked). The input that
//! fills the buffer triggers one classifier call for the whole batch; its
//! outcome releases every held input:
//!
//! - rate limited (429) or transport failure: reissue the same request,
//!   up to `max_attempts` requests in total. Exhaustion discards the batch.
//! - any other non-success status, or a result count that differs from
//!   the batch size: discard the batch.
//! - otherwise each result is applied on its own; a result with an
//!   `error_code` discards only that listing.
//!
//! A discarded batch adds its size to `norm-error` and logs one discard
//! entry per listing. The buffer is cleared in `post_process`, and only
//! after a flush happened on that call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobflow_conveyor::reports::{NORM_BATCH_ERROR, NORM_ERROR, NORM_ITEM_ERROR};
use jobflow_conveyor::{
    document_key, log_discard, Disposition, Emitter, NormalizedJob, Reports, Stage,
};
use jobflow_core::config::ClassifierConfig;
use jobflow_core::{JobDocument, StoreKeys};
use jobflow_queue::{MicroBatcher, SharedStore};
use tracing::{error, info, warn};

use crate::classifier::{
    item_failed, Classifier, ClassifierJob, ClassifierReply, ClassifierRequest, RetryBudget,
};
use crate::error::StageError;

/// How a batch call ended.
#[derive(Debug)]
enum BatchOutcome {
    Reply(ClassifierReply),
    Exhausted { attempts: u32 },
}

pub struct BatchRetryProcessor {
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
    reports: Reports,
    batch: MicroBatcher<JobDocument>,
    max_attempts: u32,
    budget: RetryBudget,
    location_edit_distance: u32,
    flushed: bool,
}

impl BatchRetryProcessor {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn SharedStore>,
        keys: StoreKeys,
        reports: Reports,
        config: &ClassifierConfig,
        idle_flush: Option<Duration>,
    ) -> Self {
        let budget = if config.backoff {
            RetryBudget::preset()
        } else {
            RetryBudget::immediate()
        };
        Self {
            classifier,
            store,
            keys,
            reports,
            batch: MicroBatcher::new(config.batch_size, idle_flush),
            max_attempts: config.max_attempts.max(1),
            budget,
            location_edit_distance: config.location_edit_distance,
            flushed: false,
        }
    }

    pub fn with_budget(mut self, budget: RetryBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Listings currently buffered.
    pub fn buffered(&self) -> usize {
        self.batch.len()
    }

    async fn call_with_retry(&self, request: &ClassifierRequest) -> BatchOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.classifier.classify(request).await {
                Ok(reply) if !reply.is_rate_limited() => return BatchOutcome::Reply(reply),
                Ok(_) => info!(batch_id = request.batch_id, attempts, "classifier rate limited"),
                Err(e) => warn!(
                    batch_id = request.batch_id,
                    attempts,
                    error = %e,
                    "classifier call failed"
                ),
            }
            if attempts >= self.max_attempts {
                return BatchOutcome::Exhausted { attempts };
            }
            let delay = self.budget.delay(attempts as usize);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Send the buffered batch and emit the results. Sets the flush flag.
    ///
    /// Infallible past this point: the buffer is spoken for, so counter
    /// failures are logged rather than returned.
    async fn flush(&mut self, out: &mut Emitter<NormalizedJob>, batch_id: i64) {
        self.flushed = true;
        let jobs: Vec<ClassifierJob> = self
            .batch
            .items()
            .iter()
            .map(|doc| ClassifierJob::from_document(doc, self.location_edit_distance))
            .collect();
        let size = jobs.len();
        let request = ClassifierRequest::new(batch_id, jobs);

        let results = match self.call_with_retry(&request).await {
            BatchOutcome::Exhausted { attempts } => {
                error!(batch_id, attempts, "classifier retries exhausted, giving up on batch");
                return self.discard_batch("norm request failed").await;
            }
            BatchOutcome::Reply(reply) if !reply.is_success() => {
                error!(batch_id, status = reply.status, "classifier rejected batch");
                return self.discard_batch("norm request rejected").await;
            }
            BatchOutcome::Reply(reply) => reply.body.unwrap_or_default().normalized_jobs,
        };

        if results.len() != size {
            error!(
                batch_id,
                sent = size,
                received = results.len(),
                "classifier result count mismatch"
            );
            return self.discard_batch("norm response invalid").await;
        }

        for (doc, response) in self.batch.items().iter().zip(results) {
            if item_failed(&response) {
                self.count(NORM_ITEM_ERROR, 1).await;
                log_discard(&doc.id, &doc.feed_name, "norm failed");
                continue;
            }
            out.emit(NormalizedJob {
                document: doc.clone(),
                response,
            });
        }
        info!(batch_id, size, emitted = out.len(), "batch normalized");
    }

    async fn discard_batch(&self, reason: &str) {
        self.count(NORM_ERROR, self.batch.len() as i64).await;
        self.count(NORM_BATCH_ERROR, 1).await;
        for doc in self.batch.items() {
            log_discard(&doc.id, &doc.feed_name, reason);
        }
    }

    async fn count(&self, report: &str, n: i64) {
        if let Err(e) = self.reports.incr_by(report, n).await {
            warn!(report, error = %e, "failed to update error report");
        }
    }
}

#[async_trait]
impl Stage for BatchRetryProcessor {
    type Input = JobDocument;
    type Output = NormalizedJob;
    type Error = StageError;

    fn name(&self) -> &str {
        "normalize"
    }

    fn message_key(&self, output: &NormalizedJob) -> String {
        document_key(&output.document)
    }

    async fn process(
        &mut self,
        doc: JobDocument,
        out: &mut Emitter<NormalizedJob>,
    ) -> Result<Disposition, StageError> {
        if self.batch.len() + 1 < self.batch.max_size() {
            self.batch.push(doc);
            return Ok(Disposition::Held);
        }
        // Draw the id before buffering so a store failure leaves the buffer as it was.
        let batch_id = self.store.incr(&self.keys.batch_id()).await?;
        self.batch.push(doc);
        self.flush(out, batch_id).await;
        Ok(Disposition::Released)
    }

    async fn post_process(&mut self) {
        if self.flushed {
            self.batch.clear();
            self.flushed = false;
        }
    }

    async fn on_idle(&mut self, out: &mut Emitter<NormalizedJob>) -> Result<bool, StageError> {
        if !self.batch.is_expired() {
            return Ok(false);
        }
        let batch_id = self.store.incr(&self.keys.batch_id()).await?;
        info!(batch_id, size = self.batch.len(), "flushing partial batch");
        self.flush(out, batch_id).await;
        Ok(true)
    }
}
