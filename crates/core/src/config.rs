use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub redis: RedisConfig,
    pub opensearch: OpenSearchConfig,
    pub classifier: ClassifierConfig,
    pub master: MasterConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `JOBFLOW_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("JOBFLOW_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            redis: RedisConfig::from_env_profiled(p),
            opensearch: OpenSearchConfig::from_env_profiled(p),
            classifier: ClassifierConfig::from_env_profiled(p),
            master: MasterConfig::from_env_profiled(p),
            worker: WorkerConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  redis:       namespace={}", self.redis.namespace);
        tracing::info!(
            "  opensearch:  host={}, index={}, batch={}",
            self.opensearch.host, self.opensearch.index, self.opensearch.batch_size
        );
        tracing::info!(
            "  classifier:  url={}, batch={}, attempts={}, backoff={}",
            self.classifier.url,
            self.classifier.batch_size,
            self.classifier.max_attempts,
            self.classifier.backoff
        );
        tracing::info!(
            "  master:      interval={}s, max_idle={}s, rerun_wait={}s",
            self.master.interval_secs, self.master.max_idle_secs, self.master.rerun_wait_secs
        );
        tracing::info!(
            "  worker:      poll_wait={}ms, idle_flush={}s, feed_timeout={}s",
            self.worker.poll_wait_ms, self.worker.idle_flush_secs, self.worker.feed_timeout_secs
        );
    }
}

// ── Redis (shared store + queue) ──────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Key prefix shared by every worker of one deployment.
    pub namespace: String,
}

impl RedisConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "REDIS_URL", "redis://127.0.0.1:6379/0"),
            namespace: profiled_env_or(p, "JOBFLOW_NAMESPACE", "jobflow"),
        }
    }
}

// ── OpenSearch / Elasticsearch ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSearchConfig {
    pub host: String,
    pub port: u16,
    pub index: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_ssl: bool,
    /// Documents buffered by the sink before one `_bulk` request.
    pub batch_size: usize,
}

impl OpenSearchConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "OPENSEARCH_HOST", "localhost"),
            port: profiled_env_u16(p, "OPENSEARCH_PORT", 9200),
            index: profiled_env_or(p, "OPENSEARCH_INDEX", "jobs"),
            username: profiled_env_opt(p, "OPENSEARCH_USERNAME"),
            password: profiled_env_opt(p, "OPENSEARCH_PASSWORD"),
            use_ssl: profiled_env_bool(p, "OPENSEARCH_USE_SSL", false),
            batch_size: profiled_env_u32(p, "ES_BATCH_SIZE", 500).max(1) as usize,
        }
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

// ── External classifier ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub url: String,
    pub batch_size: usize,
    /// Ceiling on requests issued for one batch while rate limited.
    pub max_attempts: u32,
    /// Sleep according to the retry budget table between rate-limited attempts.
    pub backoff: bool,
    pub location_edit_distance: u32,
    pub timeout_secs: u64,
}

impl ClassifierConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "NORM_URL", "http://localhost:8080/normalize/jobs"),
            batch_size: profiled_env_u32(p, "NORM_BATCH_SIZE", 50).max(1) as usize,
            max_attempts: profiled_env_u32(p, "NORM_MAX_ATTEMPTS", 10).max(1),
            backoff: profiled_env_bool(p, "NORM_RETRY_BACKOFF", false),
            location_edit_distance: profiled_env_u32(p, "LOCATION_EDIT_DISTANCE", 2),
            timeout_secs: profiled_env_u64(p, "NORM_TIMEOUT_SECS", 120),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Master controller ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Poll interval used in INIT and MONITOR.
    pub interval_secs: u64,
    /// Settle delay applied once after every worker reported ready.
    pub settle_secs: u64,
    /// Unchanged-counter duration after which a run is considered finished.
    pub max_idle_secs: u64,
    /// Cooldown between FINISH and the next SETUP.
    pub rerun_wait_secs: u64,
    /// Upper bound for one sleep while idling.
    pub idle_sleep_secs: u64,
}

impl MasterConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            interval_secs: profiled_env_u64(p, "MASTER_INTERVAL_SECS", 10),
            settle_secs: profiled_env_u64(p, "QUEUE_SETTLE_SECS", 30),
            max_idle_secs: profiled_env_u64(p, "TOPIC_COUNT_MAX_IDLE_SECS", 600),
            rerun_wait_secs: profiled_env_u64(p, "TASK_RERUN_WAIT_SECS", 15 * 60),
            idle_sleep_secs: profiled_env_u64(p, "IDLE_SLEEP_SECS", 60).max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn rerun_wait(&self) -> Duration {
        Duration::from_secs(self.rerun_wait_secs)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_secs(self.idle_sleep_secs)
    }
}

// ── Stage workers ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Bounded wait for the next queue message.
    pub poll_wait_ms: u64,
    /// Idle time after which a batching stage flushes a partial buffer. 0 disables.
    pub idle_flush_secs: u64,
    pub desc_max_len: usize,
    /// Timeout for one feed download.
    pub feed_timeout_secs: u64,
}

impl WorkerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            poll_wait_ms: profiled_env_u64(p, "WORKER_POLL_WAIT_MS", 2000),
            idle_flush_secs: profiled_env_u64(p, "BATCH_IDLE_FLUSH_SECS", 30),
            desc_max_len: profiled_env_u32(p, "JOB_DESC_MAX_LEN", 10_000) as usize,
            feed_timeout_secs: profiled_env_u64(p, "FEED_TIMEOUT_SECS", 300),
        }
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }

    pub fn idle_flush(&self) -> Option<Duration> {
        (self.idle_flush_secs > 0).then(|| Duration::from_secs(self.idle_flush_secs))
    }
}
