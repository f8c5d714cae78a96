//! Enrich stage: apply the classifier result, validate, assign the
//! canonical identity and stamp the run token.

use std::sync::Arc;

use async_trait::async_trait;
use jobflow_conveyor::reports::ENRICH_INVALID;
use jobflow_conveyor::{
    document_key, log_discard, Disposition, Emitter, NormalizedJob, Reports, Stage,
};
use jobflow_core::{FieldMap, JobDocument, StoreKeys};
use jobflow_queue::SharedStore;
use serde_json::{json, Map, Value};

use crate::error::StageError;
use crate::feeds::is_blank;
use crate::identity::canonical_identity;

/// Major-priority scores that land a major in bucket 1.
const MAJOR_BUCKET_1: [f64; 4] = [50.0, 45.0, 37.0, 35.0];
/// Major-priority scores that land a major in bucket 3. Everything else is bucket 2.
const MAJOR_BUCKET_3: [f64; 3] = [80.0, 55.0, 40.0];

const REQUIRED_FIELDS: [&str; 4] = ["title", "company", "city", "state"];

fn score_in(score: f64, choices: &[f64]) -> bool {
    choices.iter().any(|c| (score - c).abs() < 0.001)
}

fn fill_majors(fields: &mut FieldMap, response: &Value) {
    let priority = match response.get("major") {
        Some(Value::Object(m)) if !m.is_empty() => m.clone(),
        _ => {
            fields.insert("majorPriority".into(), Value::Object(Map::new()));
            return;
        }
    };

    let (mut bucket_1, mut bucket_2, mut bucket_3) = (Vec::new(), Vec::new(), Vec::new());
    for (major, score) in &priority {
        let score = score.as_f64().unwrap_or_default();
        if score_in(score, &MAJOR_BUCKET_1) {
            bucket_1.push(major.clone());
        } else if score_in(score, &MAJOR_BUCKET_3) {
            bucket_3.push(major.clone());
        } else {
            bucket_2.push(major.clone());
        }
    }

    let majors: Vec<String> = priority.keys().cloned().collect();
    fields.insert("majors".into(), json!(majors));
    fields.insert("majorsBucket1".into(), json!(bucket_1));
    fields.insert("majorsBucket2".into(), json!(bucket_2));
    fields.insert("majorsBucket3".into(), json!(bucket_3));
    fields.insert("majorPriority".into(), Value::Object(priority));
}

fn get_or(response: &Value, key: &str, fallback: Value) -> Value {
    match response.get(key) {
        Some(v) if !is_blank(v) => v.clone(),
        _ => fallback,
    }
}

fn first_char(v: &Value) -> Value {
    v.as_str()
        .and_then(|s| s.chars().next())
        .map_or(Value::Null, |c| Value::String(c.to_string()))
}

fn text_of(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "None".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Overlay classifier output onto the listing fields.
pub fn apply_response(fields: &mut FieldMap, response: &Value) {
    let title = response.get("closest_lay_title").cloned().unwrap_or(Value::Null);
    let city = response.get("normalized_city").cloned().unwrap_or(Value::Null);
    let company_display = get_or(
        response,
        "display_org_name",
        fields.get("company").cloned().unwrap_or(Value::Null),
    );

    fill_majors(fields, response);

    let updates = [
        ("title", title.clone()),
        ("industry", get_or(response, "major_group_string", Value::Null)),
        ("socCode", get_or(response, "soc_code", Value::Null)),
        ("skillsets", get_or(response, "skills", json!([]))),
        ("city", city.clone()),
        ("state", get_or(response, "normalized_state_name", Value::Null)),
        ("company", get_or(response, "clean_org_name", Value::Null)),
        ("companyDisplay", company_display),
        ("jobLevel", get_or(response, "jobLevel", json!(0))),
        ("educationDegree", get_or(response, "educationDegree", json!(0))),
        ("jobTypes", get_or(response, "job_type", json!([]))),
        ("benefits", get_or(response, "benefits", json!([]))),
        ("visaStatus", get_or(response, "Visa_sponsorship", json!(""))),
        ("title1", first_char(&title)),
        ("city1", first_char(&city)),
    ];
    for (key, value) in updates {
        fields.insert(key.to_string(), value);
    }

    let broad = match fields.get("socCode").and_then(Value::as_str) {
        Some(soc) if soc.len() >= 6 => soc.chars().take(6).collect(),
        _ => "00-000".to_string(),
    };
    let location = format!("{}_{}", text_of(fields.get("city")), text_of(fields.get("state")));
    let title_state = format!("{}_{}", text_of(fields.get("title")), text_of(fields.get("state")));
    let price = fields
        .get("price")
        .filter(|v| !is_blank(v))
        .cloned()
        .unwrap_or(json!(0));

    fields.insert("broad".into(), Value::String(broad));
    fields.insert("location".into(), Value::String(location));
    fields.insert("titleState".into(), Value::String(title_state));
    fields.insert("price".into(), price);
}

/// Required normalized fields that are missing or empty.
pub fn missing_fields(fields: &FieldMap) -> Vec<&'static str> {
    REQUIRED_FIELDS
        .into_iter()
        .filter(|key| fields.get(*key).map_or(true, is_blank))
        .collect()
}

fn unknown_fields_reason(missing: &[&str]) -> String {
    format!("fields unknown: {}", missing.join(", "))
}

pub struct EnrichStage {
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
    reports: Reports,
}

impl EnrichStage {
    pub fn new(store: Arc<dyn SharedStore>, keys: StoreKeys, reports: Reports) -> Self {
        Self {
            store,
            keys,
            reports,
        }
    }
}

#[async_trait]
impl Stage for EnrichStage {
    type Input = NormalizedJob;
    type Output = JobDocument;
    type Error = StageError;

    fn name(&self) -> &str {
        "enrich"
    }

    fn message_key(&self, output: &JobDocument) -> String {
        document_key(output)
    }

    async fn process(
        &mut self,
        input: NormalizedJob,
        out: &mut Emitter<JobDocument>,
    ) -> Result<Disposition, StageError> {
        let NormalizedJob {
            mut document,
            response,
        } = input;
        apply_response(&mut document.fields, &response);

        let missing = missing_fields(&document.fields);
        if !missing.is_empty() {
            self.reports.incr(ENRICH_INVALID).await?;
            log_discard(&document.id, &document.feed_name, &unknown_fields_reason(&missing));
            return Ok(Disposition::Complete);
        }

        let token = self
            .store
            .get(&self.keys.process_seq())
            .await?
            .ok_or(StageError::MissingRunToken)?;

        document.id = canonical_identity(&document.fields);
        document.stamp_process_seq(&token);
        out.emit(document);
        Ok(Disposition::Complete)
    }
}
