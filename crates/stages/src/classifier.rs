//! External job classification service.

use std::time::Duration;

use async_trait::async_trait;
use jobflow_core::JobDocument;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::error::StageError;

/// One job in a classification request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierJob {
    pub title: String,
    pub description: String,
    pub soc_hint: String,
    pub organization: String,
    pub city: String,
    pub state: String,
    pub edit_distance_threshold: u32,
}

impl ClassifierJob {
    pub fn from_document(doc: &JobDocument, edit_distance_threshold: u32) -> Self {
        Self {
            title: doc.text("title").unwrap_or_default(),
            description: doc.text("desc").unwrap_or_default(),
            soc_hint: doc.text("socCodeHint").unwrap_or_else(|| "Undefined".to_string()),
            organization: doc.text("company").unwrap_or_default(),
            city: doc.text("city").unwrap_or_default(),
            state: doc.text("state").unwrap_or_default(),
            edit_distance_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierRequest {
    pub batch_id: i64,
    pub classify_job_level: bool,
    pub classify_major: bool,
    pub classify_education_degree: bool,
    pub extract_benefits: bool,
    pub extract_visa_status: bool,
    pub extract_job_type: bool,
    pub jobs: Vec<ClassifierJob>,
}

impl ClassifierRequest {
    pub fn new(batch_id: i64, jobs: Vec<ClassifierJob>) -> Self {
        Self {
            batch_id,
            classify_job_level: true,
            classify_major: true,
            classify_education_degree: true,
            extract_benefits: true,
            extract_visa_status: true,
            extract_job_type: true,
            jobs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClassifierResponse {
    #[serde(default)]
    pub normalized_jobs: Vec<Value>,
}

/// Status and (when it parsed) body of one classification call.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierReply {
    pub status: u16,
    pub body: Option<ClassifierResponse>,
}

impl ClassifierReply {
    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS.as_u16()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Per-item error marker in a classifier result.
pub fn item_failed(item: &Value) -> bool {
    item.get("error_code").is_some()
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Issue one request. Any HTTP status is a reply; only transport failures are `Err`.
    async fn classify(&self, request: &ClassifierRequest) -> Result<ClassifierReply, StageError>;
}

pub struct HttpClassifier {
    client: Client,
    url: String,
}

impl HttpClassifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    #[instrument(
        skip(self, request),
        fields(batch_id = request.batch_id, jobs = request.jobs.len())
    )]
    async fn classify(&self, request: &ClassifierRequest) -> Result<ClassifierReply, StageError> {
        let response = self.client.post(&self.url).json(request).send().await?;
        let status = response.status();
        let body = if status.is_success() {
            response.json::<ClassifierResponse>().await.ok()
        } else {
            None
        };
        Ok(ClassifierReply {
            status: status.as_u16(),
            body,
        })
    }
}

/// Delay table indexed by consecutive failures of one batch call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBudget {
    steps: Vec<(Duration, Duration)>,
}

impl RetryBudget {
    /// Immediate retries.
    pub fn immediate() -> Self {
        Self { steps: Vec::new() }
    }

    /// 3s, 10s, 60s±10s, 10m±30s, 30m±2m; the last step repeats.
    pub fn preset() -> Self {
        let secs = Duration::from_secs;
        Self {
            steps: vec![
                (secs(3), secs(0)),
                (secs(10), secs(0)),
                (secs(60), secs(10)),
                (secs(600), secs(30)),
                (secs(1800), secs(120)),
            ],
        }
    }

    pub fn new(steps: Vec<(Duration, Duration)>) -> Self {
        Self { steps }
    }

    /// Base delay and jitter bound for the `failures`-th failure (1-based).
    pub fn step(&self, failures: usize) -> (Duration, Duration) {
        let Some(last) = self.steps.len().checked_sub(1) else {
            return (Duration::ZERO, Duration::ZERO);
        };
        self.steps[failures.saturating_sub(1).min(last)]
    }

    /// Delay with uniform jitter in `[0, jitter]` added.
    pub fn delay(&self, failures: usize) -> Duration {
        let (base, jitter) = self.step(failures);
        if jitter.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
        base + Duration::from_millis(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::FieldMap;
    use serde_json::json;

    #[test]
    fn job_defaults_for_missing_fields() {
        let mut fields = FieldMap::new();
        fields.insert("title".into(), json!("Cook"));
        fields.insert("company".into(), json!("Diner"));
        let doc = JobDocument::new("j", fields, "appcast", 1);
        let job = ClassifierJob::from_document(&doc, 2);
        assert_eq!(job.title, "Cook");
        assert_eq!(job.organization, "Diner");
        assert_eq!(job.soc_hint, "Undefined");
        assert_eq!(job.city, "");
        assert_eq!(job.edit_distance_threshold, 2);
    }

    #[test]
    fn request_wire_names() {
        let req = ClassifierRequest::new(7, vec![]);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["batch_id"], json!(7));
        assert_eq!(v["classify_major"], json!(true));
        assert_eq!(v["jobs"], json!([]));
    }

    #[test]
    fn response_without_jobs_is_empty() {
        let resp: ClassifierResponse = serde_json::from_value(json!({"status": "ok"})).unwrap();
        assert!(resp.normalized_jobs.is_empty());
    }

    #[test]
    fn preset_steps_clamp_to_last() {
        let budget = RetryBudget::preset();
        assert_eq!(budget.step(1), (Duration::from_secs(3), Duration::ZERO));
        assert_eq!(budget.step(3).0, Duration::from_secs(60));
        assert_eq!(budget.step(99).0, Duration::from_secs(1800));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let budget = RetryBudget::preset();
        for _ in 0..50 {
            let d = budget.delay(3);
            assert!(d >= Duration::from_secs(60) && d <= Duration::from_secs(70));
        }
    }

    #[test]
    fn immediate_budget_never_waits() {
        assert_eq!(RetryBudget::immediate().delay(5), Duration::ZERO);
    }

    #[test]
    fn error_marker() {
        assert!(item_failed(&json!({"error_code": 3})));
        assert!(!item_failed(&json!({"soc_code": "11-1011"})));
    }
}
