//! Document store: OpenSearch/Elasticsearch `_bulk` upserts and
//! end-of-run cleanup of documents from older runs.

use async_trait::async_trait;
use jobflow_core::config::OpenSearchConfig;
use jobflow_core::{JobDocument, PROCESS_SEQ_FIELD};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::error::StageError;

/// Result of one bulk request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub indexed: usize,
    pub failed: usize,
}

/// Result of a stale-document cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub deleted: u64,
    pub total: u64,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Index or replace every document by id. `Err` means the request as a
    /// whole failed; per-item failures are reported in the summary.
    async fn bulk_upsert(&self, docs: &[JobDocument]) -> Result<BulkSummary, StageError>;

    /// Delete every document whose run token differs from `token`.
    async fn delete_stale(&self, token: &str) -> Result<CleanupSummary, StageError>;
}

pub struct OpenSearchStore {
    client: Client,
    base_url: String,
    index: String,
    auth: Option<(String, String)>,
}

impl OpenSearchStore {
    pub fn new(config: &OpenSearchConfig) -> Self {
        let auth = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        Self {
            client: Client::new(),
            base_url: config.base_url(),
            index: config.index.clone(),
            auth,
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}/{}", self.base_url, path));
        match &self.auth {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }
}

/// NDJSON body for `_bulk`: an `index` action line and the source per document.
pub fn bulk_body(index: &str, docs: &[JobDocument]) -> Result<String, StageError> {
    let mut body = String::new();
    for doc in docs {
        let action = json!({ "index": { "_index": index, "_id": doc.id } });
        body.push_str(&action.to_string());
        body.push('\n');
        let source = serde_json::to_string(&doc.fields).map_err(|e| {
            StageError::DocumentStore(format!("unserializable document {}: {e}", doc.id))
        })?;
        body.push_str(&source);
        body.push('\n');
    }
    Ok(body)
}

/// Query matching documents not stamped with `token`.
pub fn stale_query(token: &str) -> Value {
    json!({
        "query": {
            "bool": {
                "must_not": { "term": { PROCESS_SEQ_FIELD: token } }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct DeleteByQueryResponse {
    #[serde(default)]
    deleted: u64,
    #[serde(default)]
    total: u64,
}

fn item_error(item: &Value) -> Option<&Value> {
    item.as_object()?.values().next()?.get("error")
}

#[async_trait]
impl DocumentStore for OpenSearchStore {
    #[instrument(skip(self, docs), fields(index = %self.index, docs = docs.len()))]
    async fn bulk_upsert(&self, docs: &[JobDocument]) -> Result<BulkSummary, StageError> {
        if docs.is_empty() {
            return Ok(BulkSummary::default());
        }
        let response = self
            .post("_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(&self.index, docs)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StageError::DocumentStore(format!("bulk returned {status}: {body}")));
        }

        let parsed: BulkResponse = response.json().await?;
        let failed = parsed
            .items
            .iter()
            .filter_map(item_error)
            .inspect(|err| warn!(error = %err, "bulk item rejected"))
            .count();
        let summary = BulkSummary {
            indexed: docs.len().saturating_sub(failed),
            failed,
        };
        debug!(indexed = summary.indexed, failed = summary.failed, "bulk upsert done");
        Ok(summary)
    }

    #[instrument(skip(self), fields(index = %self.index))]
    async fn delete_stale(&self, token: &str) -> Result<CleanupSummary, StageError> {
        let response = self
            .post(&format!("{}/_delete_by_query?conflicts=proceed", self.index))
            .json(&stale_query(token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StageError::DocumentStore(format!(
                "delete_by_query returned {status}: {body}"
            )));
        }

        let parsed: DeleteByQueryResponse = response.json().await?;
        Ok(CleanupSummary {
            deleted: parsed.deleted,
            total: parsed.total,
        })
    }
}
