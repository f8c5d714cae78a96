//! Per-feed field mapping.
//!
//! Each [`FeedKind`] maps every target field to an explicit extractor over
//! the raw record. Fields a feed does not override fall back to the shared
//! defaults in [`default_value`].

use jobflow_core::{FeedKind, FieldMap, Record};
use serde_json::Value;

/// Canonical listing fields produced by every feed, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetField {
    Source,
    Id,
    Title,
    Desc,
    Company,
    Industry,
    Zipcode,
    City,
    State,
    Country,
    Price,
    PostingDate,
    Url,
}

impl TargetField {
    pub const ALL: [TargetField; 13] = [
        TargetField::Source,
        TargetField::Id,
        TargetField::Title,
        TargetField::Desc,
        TargetField::Company,
        TargetField::Industry,
        TargetField::Zipcode,
        TargetField::City,
        TargetField::State,
        TargetField::Country,
        TargetField::Price,
        TargetField::PostingDate,
        TargetField::Url,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TargetField::Source => "source",
            TargetField::Id => "id",
            TargetField::Title => "title",
            TargetField::Desc => "desc",
            TargetField::Company => "company",
            TargetField::Industry => "industry",
            TargetField::Zipcode => "zipcode",
            TargetField::City => "city",
            TargetField::State => "state",
            TargetField::Country => "country",
            TargetField::Price => "price",
            TargetField::PostingDate => "postingDate",
            TargetField::Url => "url",
        }
    }
}

const REQUIRED: [TargetField; 3] = [TargetField::Id, TargetField::Title, TargetField::Url];

/// A record that failed validation; `fields` holds what was mapped so far.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseFailure {
    pub errors: Vec<String>,
    pub fields: FieldMap,
}

/// Maps raw records of one feed kind onto listing fields.
#[derive(Debug, Clone, Copy)]
pub struct FeedParser {
    kind: FeedKind,
    desc_max_len: usize,
}

impl FeedParser {
    pub fn new(kind: FeedKind, desc_max_len: usize) -> Self {
        Self { kind, desc_max_len }
    }

    pub fn kind(&self) -> FeedKind {
        self.kind
    }

    pub fn source_name(&self) -> &'static str {
        match self.kind {
            FeedKind::Appcast => "AC",
            FeedKind::Joveo => "RJ",
            FeedKind::Jobs2careersCpa => "J2C_CPA",
        }
    }

    fn desc_field(&self) -> &'static str {
        match self.kind {
            FeedKind::Appcast => "body",
            FeedKind::Joveo | FeedKind::Jobs2careersCpa => "description",
        }
    }

    /// Value of `field` for this feed.
    pub fn extract(&self, field: TargetField, record: &Record) -> Value {
        use FeedKind::*;
        use TargetField::*;

        match (self.kind, field) {
            (_, Source) => Value::from(self.source_name()),
            (_, Desc) => Value::from(self.description(record)),

            (Appcast, Id) => raw(record, "job_reference"),
            (Appcast, Industry) => Value::Array(vec![raw(record, "appcast_category")]),
            (Appcast, Price) => Value::from("PAY_SCALE_2"),

            (Joveo, Id) => raw(record, "referencenumber"),
            (Joveo, Industry) => Value::Array(vec![raw_or_empty(record, "category")]),
            (Joveo, Price) => Value::from("PAY_SCALE_10"),
            (Joveo, Zipcode) => raw(record, "postalcode"),
            (Joveo, PostingDate) => raw(record, "date"),

            (Jobs2careersCpa, Id) => raw(record, "referencenumber"),
            (Jobs2careersCpa, Industry) => Value::Array(vec![raw_or_empty(record, "industry0")]),
            (Jobs2careersCpa, Price) => Value::from("PAY_SCALE_1"),
            (Jobs2careersCpa, PostingDate) => raw(record, "date"),

            (_, field) => default_value(field, record),
        }
    }

    fn description(&self, record: &Record) -> String {
        let desc = record.text(self.desc_field()).unwrap_or_default();
        match desc.char_indices().nth(self.desc_max_len) {
            Some((cut, _)) => desc[..cut].to_string(),
            None => desc,
        }
    }

    /// Map, validate and tidy one record.
    pub fn parse(&self, record: &Record) -> Result<FieldMap, ParseFailure> {
        let mut fields: FieldMap = TargetField::ALL
            .into_iter()
            .map(|f| (f.as_str().to_string(), self.extract(f, record)))
            .collect();

        let errors = validate(&fields);
        if !errors.is_empty() {
            return Err(ParseFailure { errors, fields });
        }

        for key in ["title", "company", "city", "state"] {
            if let Some(Value::String(s)) = fields.get_mut(key) {
                *s = s.trim_start_matches('$').to_string();
            }
        }

        let job_id = fields.get("id").cloned().unwrap_or(Value::Null);
        let title = fields.get("title").cloned().unwrap_or(Value::Null);
        let company = fields.get("company").cloned().unwrap_or(Value::Null);
        fields.insert("jobId".into(), job_id);
        fields.insert("titleDisplay".into(), title);
        fields.insert("companyDisplay".into(), company);
        Ok(fields)
    }
}

fn default_value(field: TargetField, record: &Record) -> Value {
    match field {
        TargetField::Country => Value::from("USA"),
        TargetField::Zipcode => raw(record, "zip"),
        TargetField::PostingDate => raw(record, "posted_at"),
        other => raw(record, other.as_str()),
    }
}

fn raw(record: &Record, key: &str) -> Value {
    record.get(key).cloned().unwrap_or(Value::Null)
}

fn raw_or_empty(record: &Record, key: &str) -> Value {
    match record.get(key) {
        Some(v) if !is_blank(v) => v.clone(),
        _ => Value::from(""),
    }
}

/// Null, false, zero, empty string or empty container.
pub fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn validate(fields: &FieldMap) -> Vec<String> {
    let blank = |key: &str| fields.get(key).map_or(true, is_blank);

    if let Some(missing) = REQUIRED.iter().find(|f| blank(f.as_str())) {
        return vec![format!("missing {}", missing.as_str())];
    }
    if blank("city") && blank("state") {
        return vec!["missing city".into(), "missing state".into()];
    }
    Vec::new()
}
