use std::sync::Arc;

use jobflow_core::StoreKeys;
use jobflow_queue::{MessageQueue, SharedStore};

use crate::channel::Channel;
use crate::readiness::Readiness;
use crate::reports::Reports;
use crate::topics::ChannelName;

/// Handles shared by everything in one process: the queue, the store and
/// the key layout. Cheap to clone.
#[derive(Clone)]
pub struct Conveyor {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
}

impl Conveyor {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn SharedStore>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            store,
            keys: StoreKeys::new(namespace),
        }
    }

    pub fn channel(&self, name: ChannelName) -> Channel {
        Channel::new(name, self.queue.clone(), self.store.clone(), self.keys.clone())
    }

    /// Every channel in pipeline order.
    pub fn channels(&self) -> Vec<Channel> {
        ChannelName::ALL.into_iter().map(|n| self.channel(n)).collect()
    }

    pub fn readiness(&self) -> Readiness {
        Readiness::new(self.store.clone(), self.keys.clone())
    }

    pub fn reports(&self) -> Reports {
        Reports::new(self.store.clone(), self.keys.clone())
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }
}
