//! Stage trait and the consume → process → produce loop.
//!
//! Every stage runs inside a [`WorkerLoop`]: it pulls one delivery from its
//! input channel, hands the decoded payload to [`Stage::process`], produces
//! whatever the stage emitted, and only then settles the input:
//!
//! - `Err` from `process`: the delivery is nacked and the queue redelivers it.
//! - [`Disposition::Complete`]: the delivery is acked.
//! - [`Disposition::Held`]: the stage buffered the input. It is counted
//!   `cached` and stays unacked until a later flush releases it.
//! - [`Disposition::Released`]: a flush resolved this input and every held
//!   one; all of them are acked.
//!
//! [`Stage::post_process`] runs after every delivery whatever the outcome.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, Delivery};
use crate::error::ConveyorError;
use crate::readiness::Readiness;
use crate::reports::log_discard;

// ── Stage trait ──────────────────────────────────────────────────────

/// Where an emitted output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Primary,
    Secondary,
}

/// What the loop should do with the input after `process` returned `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Complete,
    Held,
    Released,
}

/// Collects the outputs of one `process` call.
#[derive(Debug)]
pub struct Emitter<T> {
    outputs: Vec<(Route, T)>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
        }
    }
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, item: T) {
        self.outputs.push((Route::Primary, item));
    }

    pub fn emit_to(&mut self, route: Route, item: T) {
        self.outputs.push((route, item));
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn outputs(&self) -> &[(Route, T)] {
        &self.outputs
    }

    pub fn into_outputs(self) -> Vec<(Route, T)> {
        self.outputs
    }
}

/// One pipeline step.
///
/// `process` may emit zero, one or many outputs per input. It must only
/// return `Err` while its own buffers are still intact; failures that happen
/// after a flush are the stage's to absorb.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + Sync + 'static;
    type Error: fmt::Display + Send + 'static;

    fn name(&self) -> &str;

    /// Build local caches and clients. Runs before readiness is registered.
    async fn init(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Deterministic key of an output, derived from its identity and sequence.
    fn message_key(&self, output: &Self::Output) -> String;

    async fn process(
        &mut self,
        input: Self::Input,
        out: &mut Emitter<Self::Output>,
    ) -> Result<Disposition, Self::Error>;

    async fn post_process(&mut self) {}

    /// Called when a poll came back empty. Returns `true` when buffered
    /// inputs were flushed and every held delivery can be released.
    async fn on_idle(&mut self, _out: &mut Emitter<Self::Output>) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

// ── WorkerBuilder ────────────────────────────────────────────────────

/// What one [`WorkerLoop::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing arrived and nothing was flushed.
    Idle,
    /// Nothing arrived; an idle flush released the held deliveries.
    Flushed,
    Completed,
    Held,
    Released,
    /// `process` failed; the delivery went back to the queue.
    Redeliver,
    /// The payload could not be decoded; acked and dropped.
    Dropped,
}

/// Fluent builder for a [`WorkerLoop`].
///
/// ```ignore
/// let worker = WorkerBuilder::new("clean", conveyor.channel(ChannelName::Records))
///     .primary(conveyor.channel(ChannelName::NewJobs))
///     .secondary(conveyor.channel(ChannelName::OldJobs))
///     .poll_wait(Duration::from_secs(2))
///     .build(stage, conveyor.readiness());
/// ```
pub struct WorkerBuilder {
    worker_type: String,
    input: Channel,
    primary: Option<Channel>,
    secondary: Option<Channel>,
    poll_wait: Duration,
    error_backoff: Duration,
}

impl WorkerBuilder {
    pub fn new(worker_type: impl Into<String>, input: Channel) -> Self {
        Self {
            worker_type: worker_type.into(),
            input,
            primary: None,
            secondary: None,
            poll_wait: Duration::from_secs(2),
            error_backoff: Duration::from_secs(1),
        }
    }

    pub fn primary(mut self, channel: Channel) -> Self {
        self.primary = Some(channel);
        self
    }

    pub fn secondary(mut self, channel: Channel) -> Self {
        self.secondary = Some(channel);
        self
    }

    /// Bounded wait for the next delivery (default: 2s).
    pub fn poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }

    /// Pause after a failed step before trying again (default: 1s).
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn build<S: Stage>(self, stage: S, readiness: Readiness) -> WorkerLoop<S> {
        WorkerLoop {
            stage,
            worker_type: self.worker_type,
            input: self.input,
            primary: self.primary,
            secondary: self.secondary,
            readiness,
            poll_wait: self.poll_wait,
            error_backoff: self.error_backoff,
            held: Vec::new(),
        }
    }
}

// ── WorkerLoop ───────────────────────────────────────────────────────

pub struct WorkerLoop<S: Stage> {
    stage: S,
    worker_type: String,
    input: Channel,
    primary: Option<Channel>,
    secondary: Option<Channel>,
    readiness: Readiness,
    poll_wait: Duration,
    error_backoff: Duration,
    held: Vec<Delivery>,
}

impl<S: Stage> WorkerLoop<S> {
    pub fn stage(&self) -> &S {
        &self.stage
    }

    /// Deliveries buffered by the stage and not yet acked.
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Initialize the stage, then register readiness.
    pub async fn start(&mut self) -> Result<(), ConveyorError> {
        info!(
            worker_type = %self.worker_type,
            stage = self.stage.name(),
            input = %self.input.name(),
            "starting worker"
        );
        self.stage
            .init()
            .await
            .map_err(|e| ConveyorError::Init {
                stage: self.stage.name().to_string(),
                reason: e.to_string(),
            })?;
        self.readiness.register(&self.worker_type).await?;
        Ok(())
    }

    /// Run one consume → process → produce cycle.
    pub async fn step(&mut self) -> Result<StepOutcome, ConveyorError> {
        let Some(delivery) = self.input.consume(self.poll_wait).await? else {
            return self.idle().await;
        };

        let input = match delivery.message.decode::<S::Input>() {
            Ok(input) => input,
            Err(e) => {
                let key = &delivery.message.key;
                warn!(stage = self.stage.name(), key = %key, error = %e, "undecodable payload");
                log_discard(key, self.input.name().as_str(), "undecodable payload");
                self.input.ack(&delivery).await?;
                return Ok(StepOutcome::Dropped);
            }
        };

        let mut out = Emitter::new();
        let processed = self.stage.process(input, &mut out).await;
        let outcome = self.settle(delivery, processed, out).await;
        self.stage.post_process().await;
        outcome
    }

    async fn settle(
        &mut self,
        delivery: Delivery,
        processed: Result<Disposition, S::Error>,
        out: Emitter<S::Output>,
    ) -> Result<StepOutcome, ConveyorError> {
        let disposition = match processed {
            Ok(disposition) => disposition,
            Err(e) => {
                warn!(
                    stage = self.stage.name(),
                    key = %delivery.message.key,
                    attempt = delivery.attempt,
                    error = %e,
                    "process failed, leaving message for redelivery"
                );
                self.input.nack(&delivery).await?;
                return Ok(StepOutcome::Redeliver);
            }
        };

        if let Err(e) = self.emit(out).await {
            if let Err(nack_err) = self.input.nack(&delivery).await {
                warn!(stage = self.stage.name(), error = %nack_err, "nack after failed emit");
            }
            if disposition == Disposition::Released {
                self.return_held().await;
            }
            return Err(e);
        }

        match disposition {
            Disposition::Complete => {
                self.input.ack(&delivery).await?;
                Ok(StepOutcome::Completed)
            }
            Disposition::Held => {
                self.input.mark_cached(&delivery).await?;
                self.held.push(delivery);
                Ok(StepOutcome::Held)
            }
            Disposition::Released => {
                self.input.ack(&delivery).await?;
                self.release_held().await;
                Ok(StepOutcome::Released)
            }
        }
    }

    async fn idle(&mut self) -> Result<StepOutcome, ConveyorError> {
        let mut out = Emitter::new();
        let result = match self.stage.on_idle(&mut out).await {
            Ok(flushed) => match self.emit(out).await {
                Ok(_) if flushed => {
                    self.release_held().await;
                    Ok(StepOutcome::Flushed)
                }
                Ok(_) => Ok(StepOutcome::Idle),
                Err(e) => {
                    if flushed {
                        self.return_held().await;
                    }
                    Err(e)
                }
            },
            Err(e) => {
                warn!(stage = self.stage.name(), error = %e, "idle flush failed");
                Ok(StepOutcome::Idle)
            }
        };
        self.stage.post_process().await;
        result
    }

    async fn emit(&self, out: Emitter<S::Output>) -> Result<usize, ConveyorError> {
        let mut produced = 0;
        for (route, item) in out.into_outputs() {
            let channel = self.route(route)?;
            let key = self.stage.message_key(&item);
            channel.produce(&key, &item).await?;
            produced += 1;
        }
        Ok(produced)
    }

    fn route(&self, route: Route) -> Result<&Channel, ConveyorError> {
        let channel = match route {
            Route::Primary => self.primary.as_ref(),
            Route::Secondary => self.secondary.as_ref(),
        };
        channel.ok_or_else(|| {
            ConveyorError::Config(format!(
                "{} emitted to {route:?} but no channel is wired",
                self.worker_type
            ))
        })
    }

    /// Ack every held delivery.
    async fn release_held(&mut self) {
        let held = std::mem::take(&mut self.held);
        debug!(stage = self.stage.name(), released = held.len(), "releasing held deliveries");
        for delivery in &held {
            if let Err(e) = self.input.ack(delivery).await {
                warn!(
                    stage = self.stage.name(),
                    key = %delivery.message.key,
                    error = %e,
                    "failed to ack held delivery"
                );
            }
        }
    }

    /// Hand every held delivery back to the queue.
    async fn return_held(&mut self) {
        for delivery in std::mem::take(&mut self.held) {
            if let Err(e) = self.input.nack(&delivery).await {
                warn!(
                    stage = self.stage.name(),
                    key = %delivery.message.key,
                    error = %e,
                    "failed to nack held delivery"
                );
            }
        }
    }

    /// Start, then step until `shutdown` flips to `true`.
    ///
    /// Shutdown is checked between steps; held deliveries are handed back
    /// to the queue on the way out.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConveyorError> {
        self.start().await?;
        info!(worker_type = %self.worker_type, "worker running");

        while !*shutdown.borrow() {
            match self.step().await {
                Ok(outcome) => trace!(worker_type = %self.worker_type, ?outcome, "step"),
                Err(e) => {
                    warn!(worker_type = %self.worker_type, error = %e, "worker step failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.error_backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        self.return_held().await;
        info!(worker_type = %self.worker_type, "worker stopped");
        Ok(())
    }
}
