//! Fetch stage: download a feed and fan its records out onto `records`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobflow_conveyor::{
    log_discard, Channel, Disposition, Emitter, FeedTask, RecordEnvelope, Reports, Stage,
};
use jobflow_core::{FeedSource, Record, StoreKeys};
use jobflow_queue::SharedStore;
use reqwest::Client;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::StageError;

/// `fetch-error:{feed}`.
pub fn fetch_error(feed: &str) -> String {
    format!("fetch-error:{feed}")
}

/// Reads every record of one feed.
#[async_trait]
pub trait FeedReader: Send + Sync {
    async fn read(&self, source: &FeedSource) -> Result<Vec<Record>, StageError>;
}

/// Feed served as JSON: either a top-level array of objects or an object
/// with a `jobs` array.
pub struct HttpFeedReader {
    client: Client,
}

impl HttpFeedReader {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

fn records_from(body: Value) -> Result<Vec<Record>, StageError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("jobs") {
            Some(Value::Array(items)) => items,
            _ => return Err(StageError::Feed("object feed without a `jobs` array".into())),
        },
        _ => return Err(StageError::Feed("feed is neither an array nor an object".into())),
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(fields) => Some(Record(fields)),
            _ => None,
        })
        .collect())
}

#[async_trait]
impl FeedReader for HttpFeedReader {
    #[instrument(skip(self, source), fields(feed = %source.name))]
    async fn read(&self, source: &FeedSource) -> Result<Vec<Record>, StageError> {
        let response = self.client.get(&source.url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StageError::Feed(format!("{status}: {body}")));
        }
        records_from(response.json().await?)
    }
}

pub struct FetchStage {
    reader: Arc<dyn FeedReader>,
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
    records: Channel,
    reports: Reports,
}

impl FetchStage {
    pub fn new(
        reader: Arc<dyn FeedReader>,
        store: Arc<dyn SharedStore>,
        keys: StoreKeys,
        records: Channel,
        reports: Reports,
    ) -> Self {
        Self {
            reader,
            store,
            keys,
            records,
            reports,
        }
    }
}

#[async_trait]
impl Stage for FetchStage {
    type Input = FeedTask;
    type Output = RecordEnvelope;
    type Error = StageError;

    fn name(&self) -> &str {
        "fetch"
    }

    fn message_key(&self, output: &RecordEnvelope) -> String {
        output.message_key()
    }

    async fn process(
        &mut self,
        task: FeedTask,
        out: &mut Emitter<RecordEnvelope>,
    ) -> Result<Disposition, StageError> {
        self.records.begin_producing().await?;
        let result = self.enumerate(&task, out).await;
        self.records.end_producing().await?;
        result
    }
}

impl FetchStage {
    async fn enumerate(
        &self,
        task: &FeedTask,
        out: &mut Emitter<RecordEnvelope>,
    ) -> Result<Disposition, StageError> {
        let feed = &task.source.name;
        let records = match self.reader.read(&task.source).await {
            Ok(records) => records,
            Err(e) => {
                warn!(feed = %feed, error = %e, "feed download failed");
                self.reports.incr(&fetch_error(feed)).await?;
                log_discard(&task.message_key(), feed, "feed download failed");
                return Ok(Disposition::Complete);
            }
        };

        let total = records.len() as i64;
        // One block of sequence numbers per feed.
        let last = self.store.incr_by(&self.keys.record_seq(), total).await?;
        let first = (last - total + 1) as u64;
        for (offset, record) in records.into_iter().enumerate() {
            out.emit(RecordEnvelope {
                record,
                feed_name: feed.clone(),
                seq: first + offset as u64,
            });
        }
        info!(feed = %feed, records = total, process_seq = %task.process_seq, "feed enumerated");
        Ok(Disposition::Complete)
    }
}
