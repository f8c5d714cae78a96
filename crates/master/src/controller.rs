//! The run state machine: INIT → SETUP → MONITOR → FINISH → IDLE → SETUP …
//!
//! INIT waits until every worker type reports enough ready instances.
//! SETUP wipes run-scoped state, mints the run token and seeds `feeds`.
//! MONITOR polls channel counters until the pipeline drains or stalls.
//! FINISH evicts documents from older runs (best effort). IDLE waits out
//! the cooldown before the next SETUP.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobflow_conveyor::reports::{
    clean_error, publish_error, ENRICH_INVALID, NORM_BATCH_ERROR, NORM_ERROR, NORM_ITEM_ERROR,
    SINK_ERROR,
};
use jobflow_conveyor::{Channel, ChannelCounts, ChannelName, Conveyor, FeedTask, Readiness};
use jobflow_core::config::MasterConfig;
use jobflow_core::{FeedSource, PipelineFile};
use jobflow_stages::fetch::fetch_error;
use jobflow_stages::DocumentStore;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ControllerError;
use crate::poll::{poll_until, sleep_or_shutdown, Probe};
use crate::state::{Observation, RunState};

/// Counters logged at the end of every run.
const SUMMARY_REPORTS: [&str; 5] = [
    NORM_ERROR,
    NORM_BATCH_ERROR,
    NORM_ITEM_ERROR,
    ENRICH_INVALID,
    SINK_ERROR,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Setup,
    Monitor,
    Finish,
    Idle,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Init => "INIT",
            Phase::Setup => "SETUP",
            Phase::Monitor => "MONITOR",
            Phase::Finish => "FINISH",
            Phase::Idle => "IDLE",
        };
        f.write_str(s)
    }
}

struct ReadinessProbe {
    readiness: Readiness,
    required: BTreeMap<String, u32>,
}

#[async_trait]
impl Probe for ReadinessProbe {
    type Output = ();
    type Error = ControllerError;

    async fn check(&mut self) -> Result<Option<()>, ControllerError> {
        let mut status = serde_json::Map::new();
        let mut ready = true;
        for (worker, required) in &self.required {
            let count = self.readiness.count(worker).await?;
            ready &= count >= i64::from(*required);
            status.insert(worker.clone(), json!(count));
        }
        info!(status = %serde_json::Value::Object(status), "worker status");
        Ok(ready.then_some(()))
    }
}

struct DrainProbe<'a> {
    channels: &'a [Channel],
    run: &'a mut RunState,
    max_idle: Duration,
}

#[async_trait]
impl<'a> Probe for DrainProbe<'a> {
    type Output = Observation;
    type Error = ControllerError;

    async fn check(&mut self) -> Result<Option<Observation>, ControllerError> {
        let mut snapshot: Vec<ChannelCounts> = Vec::with_capacity(self.channels.len());
        for channel in self.channels {
            snapshot.push(channel.counts().await?);
        }

        let was_idle = self.run.idle_since;
        let before = self.run.topic_check_index;
        let observation = self.run.observe(&snapshot, Instant::now(), self.max_idle);

        let newly_drained = self
            .channels
            .iter()
            .zip(&snapshot)
            .take(self.run.topic_check_index)
            .skip(before);
        for (channel, counts) in newly_drained {
            info!(channel = %channel.name(), counts = %counts, "channel drained");
        }

        match observation {
            Observation::Running => {
                if let Some(since) = self.run.idle_since {
                    let idle = since.elapsed().as_secs();
                    if was_idle.is_none() {
                        warn!("channel counters unchanged, counting idle time");
                    } else {
                        warn!(idle_secs = idle, "channel counters still unchanged");
                    }
                }
                if let (Some(channel), Some(counts)) = (
                    self.channels.get(self.run.topic_check_index),
                    snapshot.get(self.run.topic_check_index),
                ) {
                    debug!(channel = %channel.name(), counts = %counts, "channel running");
                }
                Ok(None)
            }
            Observation::Stalled { idle } => {
                warn!(
                    idle_secs = idle.as_secs(),
                    "channel counters unchanged past the idle threshold, treating run as finished"
                );
                Ok(Some(observation))
            }
            Observation::Drained => {
                info!("every channel drained");
                Ok(Some(observation))
            }
        }
    }
}

pub struct MasterController {
    conveyor: Conveyor,
    channels: Vec<Channel>,
    workers: BTreeMap<String, u32>,
    feeds: Vec<FeedSource>,
    config: MasterConfig,
    documents: Arc<dyn DocumentStore>,
    shutdown: watch::Receiver<bool>,
    phase: Phase,
    run: Option<RunState>,
}

impl MasterController {
    pub fn new(
        conveyor: Conveyor,
        pipeline: PipelineFile,
        config: MasterConfig,
        documents: Arc<dyn DocumentStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            channels: conveyor.channels(),
            conveyor,
            workers: pipeline.workers,
            feeds: pipeline.feeds,
            config,
            documents,
            shutdown,
            phase: Phase::Init,
            run: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn run_state(&self) -> Option<&RunState> {
        self.run.as_ref()
    }

    fn transition(&mut self, next: Phase) {
        info!(from = %self.phase, to = %next, "state transition");
        self.phase = next;
    }

    /// Wait for worker readiness, then settle. `false` on shutdown.
    pub async fn handle_init(&mut self) -> bool {
        info!(required = ?self.workers, "waiting for workers");
        let mut probe = ReadinessProbe {
            readiness: self.conveyor.readiness(),
            required: self.workers.clone(),
        };
        if poll_until(&mut probe, self.config.interval(), &mut self.shutdown).await.is_none() {
            return false;
        }
        info!(settle_secs = self.config.settle_secs, "workers ready");
        sleep_or_shutdown(self.config.settle(), &mut self.shutdown).await
    }

    async fn mint_token(&self) -> Result<String, ControllerError> {
        let generation = self.conveyor.store().incr(&self.conveyor.keys().generation()).await?;
        Ok(format!("{}-{}", Utc::now().format("%Y%m%d%H%M"), generation))
    }

    /// Start a fresh run and return its token.
    pub async fn handle_setup(&mut self) -> Result<String, ControllerError> {
        info!("setting up new run");
        let store = self.conveyor.store();
        let keys = self.conveyor.keys();

        let cleared = store.clear_prefix(&keys.run_prefix()).await?;
        for channel in &self.channels {
            channel.reset().await?;
        }
        debug!(cleared, "run state cleared");

        let token = self.mint_token().await?;
        store.set(&keys.process_seq(), &token).await?;
        info!(process_seq = %token, "minted run token");

        let feeds = self.conveyor.channel(ChannelName::Feeds);
        feeds.begin_producing().await?;
        for source in &self.feeds {
            let task = FeedTask {
                source: source.clone(),
                process_seq: token.clone(),
            };
            feeds.produce(&task.message_key(), &task).await?;
            info!(feed = %source.name, order = source.order, "feed queued");
        }
        feeds.end_producing().await?;

        self.run = Some(RunState::new(token.clone()));
        Ok(token)
    }

    /// Poll until drain or stall. `None` on shutdown.
    pub async fn handle_monitor(&mut self) -> Result<Option<Observation>, ControllerError> {
        let run = self.run.as_mut().ok_or(ControllerError::NoRun)?;
        let mut probe = DrainProbe {
            channels: &self.channels,
            run,
            max_idle: self.config.max_idle(),
        };
        Ok(poll_until(&mut probe, self.config.interval(), &mut self.shutdown).await)
    }

    /// Evict stale documents and record the finish time. Cleanup failures are logged only.
    pub async fn handle_finish(&mut self) -> Result<(), ControllerError> {
        let token = self
            .run
            .as_ref()
            .map(|r| r.process_seq.clone())
            .ok_or(ControllerError::NoRun)?;

        match self.documents.delete_stale(&token).await {
            Ok(summary) => {
                let rate = if summary.total > 0 {
                    summary.deleted as f64 / summary.total as f64
                } else {
                    0.0
                };
                info!(
                    deleted = summary.deleted,
                    total = summary.total,
                    rate,
                    "stale documents removed"
                );
            }
            Err(e) => warn!(process_seq = %token, error = %e, "stale document cleanup failed"),
        }

        self.log_summary().await;
        if let Some(run) = self.run.as_mut() {
            run.mark_finished(Instant::now());
            info!(
                process_seq = %run.process_seq,
                elapsed_secs = run.elapsed().num_seconds(),
                "run finished"
            );
        }
        Ok(())
    }

    async fn log_summary(&self) {
        for channel in &self.channels {
            match channel.counts().await {
                Ok(counts) => info!(channel = %channel.name(), counts = %counts, "final counts"),
                Err(e) => warn!(channel = %channel.name(), error = %e, "failed to read counts"),
            }
        }
        let per_feed = self
            .feeds
            .iter()
            .flat_map(|f| [fetch_error(&f.name), clean_error(&f.name)]);
        let per_channel = self.channels.iter().map(|c| publish_error(c.name().as_str()));
        let names: Vec<String> = SUMMARY_REPORTS
            .iter()
            .map(|s| s.to_string())
            .chain(per_feed)
            .chain(per_channel)
            .collect();
        let reports = self.conveyor.reports();
        for name in &names {
            if let Ok(n) = reports.get(name).await {
                if n > 0 {
                    warn!(report = %name, count = n, "errors this run");
                }
            }
        }
    }

    /// Sleep out the cooldown in bounded increments. `false` on shutdown.
    pub async fn handle_idle(&mut self) -> bool {
        let rerun_wait = self.config.rerun_wait();
        loop {
            let remaining = match &self.run {
                Some(run) => run.cooldown_remaining(rerun_wait, Instant::now()),
                None => Duration::ZERO,
            };
            if remaining.is_zero() {
                return true;
            }
            info!(remaining_secs = remaining.as_secs(), "idling");
            let nap = remaining.min(self.config.idle_sleep());
            if !sleep_or_shutdown(nap, &mut self.shutdown).await {
                return false;
            }
        }
    }

    /// Run the current phase and move to the next one.
    ///
    /// Returns `Ok(false)` once shutdown was observed. On `Err` the phase
    /// is unchanged and the step can be retried.
    pub async fn step(&mut self) -> Result<bool, ControllerError> {
        match self.phase {
            Phase::Init => {
                if !self.handle_init().await {
                    return Ok(false);
                }
                self.transition(Phase::Setup);
            }
            Phase::Setup => {
                self.handle_setup().await?;
                self.transition(Phase::Monitor);
            }
            Phase::Monitor => {
                if self.handle_monitor().await?.is_none() {
                    return Ok(false);
                }
                self.transition(Phase::Finish);
            }
            Phase::Finish => {
                self.handle_finish().await?;
                self.transition(Phase::Idle);
            }
            Phase::Idle => {
                if !self.handle_idle().await {
                    return Ok(false);
                }
                self.transition(Phase::Setup);
            }
        }
        Ok(true)
    }

    /// Step until shutdown. Failed steps are retried after the poll interval.
    pub async fn run_loop(mut self) -> Result<(), ControllerError> {
        info!(workers = ?self.workers, feeds = self.feeds.len(), "master starting");
        loop {
            match self.step().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(phase = %self.phase, error = %e, "step failed, retrying");
                    if !sleep_or_shutdown(self.config.interval(), &mut self.shutdown).await {
                        break;
                    }
                }
            }
        }
        info!("master stopped");
        Ok(())
    }
}
