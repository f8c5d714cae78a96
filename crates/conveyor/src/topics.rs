//! The fixed channel topology.
//!
//! fetch ← `feeds` ← master
//! clean ← `records` ← fetch
//! normalize ← `new_jobs` ← clean
//! normalize-old ← `old_jobs` ← clean
//! enrich ← `normalized` ← normalize
//! sink ← `enriched` ← enrich

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConveyorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelName {
    /// Feed descriptors seeded by the master at SETUP.
    Feeds,
    /// Raw feed records with feed name and sequence.
    Records,
    /// Listings never seen before.
    NewJobs,
    /// Listings whose identity already exists.
    OldJobs,
    /// Listings paired with their classifier result.
    Normalized,
    /// Validated listings with canonical identity, ready to index.
    Enriched,
}

impl ChannelName {
    /// Every channel in pipeline order. The master checks drain in this order.
    pub const ALL: [ChannelName; 6] = [
        ChannelName::Feeds,
        ChannelName::Records,
        ChannelName::NewJobs,
        ChannelName::OldJobs,
        ChannelName::Normalized,
        ChannelName::Enriched,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelName::Feeds => "feeds",
            ChannelName::Records => "records",
            ChannelName::NewJobs => "new_jobs",
            ChannelName::OldJobs => "old_jobs",
            ChannelName::Normalized => "normalized",
            ChannelName::Enriched => "enriched",
        }
    }

    /// Worker type that consumes this channel and registers readiness under it.
    pub fn consumer_worker_type(self) -> &'static str {
        match self {
            ChannelName::Feeds => "fetch",
            ChannelName::Records => "clean",
            ChannelName::NewJobs => "normalize",
            ChannelName::OldJobs => "normalize-old",
            ChannelName::Normalized => "enrich",
            ChannelName::Enriched => "sink",
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelName {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelName::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ConveyorError::UnknownChannel(s.to_string()))
    }
}
