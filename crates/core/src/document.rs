use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat JSON object of named attributes.
pub type FieldMap = Map<String, Value>;

/// Field under which the run token is written into indexed documents.
pub const PROCESS_SEQ_FIELD: &str = "processSeq";

/// Field carrying the content fingerprint of a listing.
pub const LISTING_HASH_FIELD: &str = "listingHash";

/// A raw feed item. Source-specific keys, never seen past the clean stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub FieldMap);

impl Record {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value of `key`; numbers are rendered, empty strings are `None`.
    pub fn text(&self, key: &str) -> Option<String> {
        value_text(self.0.get(key)?)
    }
}

impl From<FieldMap> for Record {
    fn from(fields: FieldMap) -> Self {
        Self(fields)
    }
}

/// Canonical job listing, filled in stage by stage.
///
/// `id` is the raw-source identity up to the enrich stage, where it is
/// replaced by the canonical dedup identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    pub id: String,
    pub fields: FieldMap,
    pub feed_name: String,
    pub sequence: u64,
    #[serde(default)]
    pub listing_hash: Option<String>,
    #[serde(default)]
    pub process_seq: Option<String>,
}

impl JobDocument {
    pub fn new(
        id: impl Into<String>,
        fields: FieldMap,
        feed_name: impl Into<String>,
        sequence: u64,
    ) -> Self {
        let listing_hash = fields
            .get(LISTING_HASH_FIELD)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Self {
            id: id.into(),
            fields,
            feed_name: feed_name.into(),
            sequence,
            listing_hash,
            process_seq: None,
        }
    }

    /// Non-empty string value of a field.
    pub fn text(&self, key: &str) -> Option<String> {
        value_text(self.fields.get(key)?)
    }

    /// Stamp the run token. Only the first stamp sticks; returns whether it applied.
    pub fn stamp_process_seq(&mut self, token: &str) -> bool {
        if self.process_seq.is_some() {
            return false;
        }
        self.process_seq = Some(token.to_string());
        self.fields
            .insert(PROCESS_SEQ_FIELD.to_string(), Value::String(token.to_string()));
        true
    }

    /// A document without a token belongs to a stale or incomplete run.
    pub fn belongs_to_run(&self, token: &str) -> bool {
        self.process_seq.as_deref() == Some(token)
    }
}

fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> FieldMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn process_seq_is_stamped_once() {
        let mut doc = JobDocument::new("j-1", FieldMap::new(), "appcast", 3);
        assert!(!doc.belongs_to_run("202401010000-1"));
        assert!(doc.stamp_process_seq("202401010000-1"));
        assert!(!doc.stamp_process_seq("202401010000-2"));
        assert!(doc.belongs_to_run("202401010000-1"));
        assert_eq!(doc.fields[PROCESS_SEQ_FIELD], json!("202401010000-1"));
    }

    #[test]
    fn listing_hash_is_lifted_from_fields() {
        let doc = JobDocument::new("j-2", fields(json!({"listingHash": "abc"})), "joveo", 1);
        assert_eq!(doc.listing_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn record_text_skips_empty_and_null() {
        let r = Record(fields(json!({"a": "", "b": null, "c": 12, "d": "x"})));
        assert_eq!(r.text("a"), None);
        assert_eq!(r.text("b"), None);
        assert_eq!(r.text("c").as_deref(), Some("12"));
        assert_eq!(r.text("d").as_deref(), Some("x"));
        assert_eq!(r.text("missing"), None);
    }
}
