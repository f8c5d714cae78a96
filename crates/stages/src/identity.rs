//! Listing identity, content fingerprints and new/update classification.

use std::sync::Arc;

use async_trait::async_trait;
use jobflow_core::{FieldMap, StoreKeys};
use jobflow_queue::SharedStore;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::StageError;

/// Placeholder for absent fields in the listing hash.
const UNDEFINED: &str = "undefined";

/// Whether a listing was seen before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub is_new: bool,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn identify(&self, fields: &FieldMap) -> Result<Identity, StageError>;
}

fn field_or<'a>(fields: &'a FieldMap, key: &str, fallback: &'a str) -> &'a str {
    match fields.get(key) {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => fallback,
    }
}

fn digest(parts: &[&str]) -> String {
    let digest = Sha256::digest(parts.join("|").as_bytes());
    format!("{digest:x}")
}

/// Raw-source identity: the feed's own job id within its source.
pub fn source_identity(fields: &FieldMap) -> String {
    digest(&[field_or(fields, "source", ""), field_or(fields, "jobId", "")])
}

/// Content fingerprint of a listing.
pub fn listing_hash(fields: &FieldMap) -> String {
    digest(&[
        field_or(fields, "title", UNDEFINED),
        field_or(fields, "company", UNDEFINED),
        field_or(fields, "city", UNDEFINED),
        field_or(fields, "state", UNDEFINED),
        field_or(fields, "desc", UNDEFINED),
    ])
}

/// Canonical dedup identity of a finished listing.
pub fn canonical_identity(fields: &FieldMap) -> String {
    digest(&[
        field_or(fields, "companyDisplay", ""),
        field_or(fields, "titleDisplay", ""),
        field_or(fields, "city", ""),
        field_or(fields, "state", ""),
    ])
}

/// Identity records kept in the shared store, outside the run prefix.
pub struct StoreIdentity {
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
}

impl StoreIdentity {
    pub fn new(store: Arc<dyn SharedStore>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }
}

#[async_trait]
impl IdentityResolver for StoreIdentity {
    async fn identify(&self, fields: &FieldMap) -> Result<Identity, StageError> {
        let id = source_identity(fields);
        let key = self.keys.identity(&id);
        let is_new = self.store.set_if_absent(&key, &listing_hash(fields)).await?;
        Ok(Identity { id, is_new })
    }
}
