use std::sync::Arc;

use jobflow_core::StoreKeys;
use jobflow_queue::SharedStore;
use tracing::info;

use crate::error::ConveyorError;

/// Per-worker-type readiness counters.
///
/// A worker registers once its stage initialization has completed; the
/// master waits until every type reaches its required count.
#[derive(Clone)]
pub struct Readiness {
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
}

impl Readiness {
    pub fn new(store: Arc<dyn SharedStore>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    pub async fn register(&self, worker_type: &str) -> Result<i64, ConveyorError> {
        let ready = self.store.incr(&self.keys.worker_ready(worker_type)).await?;
        info!(worker_type, ready, "worker registered ready");
        Ok(ready)
    }

    pub async fn count(&self, worker_type: &str) -> Result<i64, ConveyorError> {
        Ok(self.store.get_i64(&self.keys.worker_ready(worker_type)).await?)
    }
}
