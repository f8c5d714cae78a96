//! `jobflow.toml`: which workers must be up and which feeds seed a run.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Worker types every deployment must run at least once.
///
/// `normalize` consumes `new_jobs` and `normalize-old` consumes `old_jobs`;
/// each channel needs its own consumer or it never drains.
pub const REQUIRED_WORKER_TYPES: &[&str] =
    &["fetch", "clean", "normalize", "normalize-old", "enrich", "sink"];

/// Known feed formats. Each one maps its source fields onto the canonical listing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Appcast,
    Joveo,
    Jobs2careersCpa,
}

/// One configured feed source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub kind: FeedKind,
    pub url: String,
    /// Enumeration order when seeding a run (ascending).
    #[serde(default)]
    pub order: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFile {
    /// Worker type → number of ready instances required before a run starts.
    pub workers: BTreeMap<String, u32>,

    #[serde(default)]
    pub feeds: Vec<FeedSource>,
}

impl PipelineFile {
    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        let mut file: Self = toml::from_str(toml_str)?;
        file.apply_env_overrides();
        file.validate()?;
        file.feeds.sort_by_key(|f| f.order);
        Ok(file)
    }

    /// Load from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Convention: `JOBFLOW_WORKERS_<TYPE>=<n>` overrides `workers.<type>`.
    pub(crate) fn apply_env_overrides(&mut self) {
        for (worker, required) in self.workers.iter_mut() {
            let key = format!("JOBFLOW_WORKERS_{}", worker.to_uppercase().replace('-', "_"));
            if let Some(n) = std::env::var(&key).ok().and_then(|v| v.parse::<u32>().ok()) {
                *required = n;
            }
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.workers.contains_key("normalize") && !self.workers.contains_key("normalize-old") {
            return Err(CoreError::Invalid(
                "no consumer for old_jobs: add 'normalize-old' to [workers]".into(),
            ));
        }
        for required in REQUIRED_WORKER_TYPES {
            if !self.workers.contains_key(*required) {
                return Err(CoreError::Invalid(format!(
                    "worker type '{required}' missing from [workers]"
                )));
            }
        }
        for (name, count) in &self.workers {
            if *count == 0 {
                return Err(CoreError::Invalid(format!(
                    "worker type '{name}' must require at least one instance"
                )));
            }
        }
        let mut seen = HashSet::new();
        for feed in &self.feeds {
            if !seen.insert(feed.name.as_str()) {
                return Err(CoreError::Invalid(format!("duplicate feed name '{}'", feed.name)));
            }
            if feed.url.is_empty() {
                return Err(CoreError::Invalid(format!("feed '{}' has no url", feed.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[workers]
fetch = 1
clean = 2
normalize = 3
normalize-old = 1
enrich = 1
sink = 1

[[feeds]]
name = "rj"
kind = "joveo"
url = "http://feeds.local/joveo.json"
order = 2

[[feeds]]
name = "ac"
kind = "appcast"
url = "http://feeds.local/appcast.json"
order = 1
"#;

    #[test]
    fn parse_full_file() {
        let file = PipelineFile::from_toml(FULL).unwrap();
        assert_eq!(file.workers["normalize"], 3);
        assert_eq!(file.workers["normalize-old"], 1);
        assert_eq!(file.feeds.len(), 2);
        // sorted by order
        assert_eq!(file.feeds[0].name, "ac");
        assert_eq!(file.feeds[0].kind, FeedKind::Appcast);
        assert_eq!(file.feeds[1].kind, FeedKind::Joveo);
    }

    #[test]
    fn missing_stage_is_rejected() {
        let toml = r#"
[workers]
fetch = 1
clean = 1
"#;
        let err = PipelineFile::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("normalize"));
    }

    #[test]
    fn missing_old_jobs_consumer_is_rejected() {
        let toml = r#"
[workers]
fetch = 1
clean = 1
normalize = 2
enrich = 1
sink = 1
"#;
        let err = PipelineFile::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("old_jobs"), "{err}");
    }

    #[test]
    fn zero_instances_rejected() {
        let toml = r#"
[workers]
fetch = 1
clean = 1
normalize = 0
normalize-old = 1
enrich = 1
sink = 1
"#;
        assert!(PipelineFile::from_toml(toml).is_err());
    }

    #[test]
    fn duplicate_feed_names_rejected() {
        let toml = r#"
[workers]
fetch = 1
clean = 1
normalize = 1
normalize-old = 1
enrich = 1
sink = 1

[[feeds]]
name = "a"
kind = "joveo"
url = "http://x"

[[feeds]]
name = "a"
kind = "appcast"
url = "http://y"
"#;
        let err = PipelineFile::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn feed_kind_snake_case() {
        let toml = r#"
[workers]
fetch = 1
clean = 1
normalize = 1
normalize-old = 1
enrich = 1
sink = 1

[[feeds]]
name = "j2c"
kind = "jobs2careers_cpa"
url = "http://z"
"#;
        let file = PipelineFile::from_toml(toml).unwrap();
        assert_eq!(file.feeds[0].kind, FeedKind::Jobs2careersCpa);
    }
}
