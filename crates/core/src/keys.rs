//! Shared-store key layout.
//!
//! Everything a run owns lives under `{namespace}:run:` so SETUP can wipe
//! it with one prefix clear. Readiness counters, the generation counter and
//! identity records sit outside that prefix and survive across runs.

/// One of the three per-channel counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Produced,
    Consumed,
    Cached,
}

impl Counter {
    pub fn as_str(self) -> &'static str {
        match self {
            Counter::Produced => "produced",
            Counter::Consumed => "consumed",
            Counter::Cached => "cached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    namespace: String,
}

impl StoreKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prefix of every key cleared at SETUP.
    pub fn run_prefix(&self) -> String {
        format!("{}:run:", self.namespace)
    }

    pub fn worker_ready(&self, worker_type: &str) -> String {
        format!("{}:ready:{}", self.namespace, worker_type)
    }

    pub fn generation(&self) -> String {
        format!("{}:generation", self.namespace)
    }

    pub fn process_seq(&self) -> String {
        format!("{}:run:process_seq", self.namespace)
    }

    pub fn batch_id(&self) -> String {
        format!("{}:run:batch_id", self.namespace)
    }

    pub fn record_seq(&self) -> String {
        format!("{}:run:record_seq", self.namespace)
    }

    pub fn channel_counter(&self, channel: &str, counter: Counter) -> String {
        format!("{}:run:channel:{}:{}", self.namespace, channel, counter.as_str())
    }

    pub fn producer_state(&self, channel: &str) -> String {
        format!("{}:run:channel:{}:producer", self.namespace, channel)
    }

    pub fn producer_inflight(&self, channel: &str) -> String {
        format!("{}:run:channel:{}:producers", self.namespace, channel)
    }

    pub fn report(&self, name: &str) -> String {
        format!("{}:run:report:{}", self.namespace, name)
    }

    pub fn identity(&self, id: &str) -> String {
        format!("{}:identity:{}", self.namespace, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_scoped_keys_share_the_run_prefix() {
        let keys = StoreKeys::new("jf");
        let prefix = keys.run_prefix();
        for key in [
            keys.process_seq(),
            keys.batch_id(),
            keys.record_seq(),
            keys.channel_counter("records", Counter::Consumed),
            keys.producer_state("feeds"),
            keys.producer_inflight("records"),
            keys.report("norm-error"),
        ] {
            assert!(key.starts_with(&prefix), "{key} should be run scoped");
        }
    }

    #[test]
    fn durable_keys_are_not_run_scoped() {
        let keys = StoreKeys::new("jf");
        let prefix = keys.run_prefix();
        assert!(!keys.worker_ready("clean").starts_with(&prefix));
        assert!(!keys.identity("abc").starts_with(&prefix));
        assert!(!keys.generation().starts_with(&prefix));
    }
}
