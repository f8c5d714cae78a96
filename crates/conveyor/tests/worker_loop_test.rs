//! Integration tests for the worker loop over in-memory channels.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobflow_conveyor::{
    ChannelCounts, ChannelName, Conveyor, Disposition, Emitter, Route, Stage, StepOutcome,
    WorkerBuilder,
};
use jobflow_queue::{MemoryQueue, MemoryStore};
use tokio::sync::watch;

const WAIT: Duration = Duration::from_millis(10);

fn conveyor() -> Conveyor {
    Conveyor::new(Arc::new(MemoryQueue::new()), Arc::new(MemoryStore::new()), "test")
}

/// Even numbers go to the primary channel, odd ones to the secondary; 13 fails.
struct Router {
    post_process_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Stage for Router {
    type Input = u32;
    type Output = u32;
    type Error = String;

    fn name(&self) -> &str {
        "router"
    }

    fn message_key(&self, output: &u32) -> String {
        format!("n-{output}")
    }

    async fn process(&mut self, n: u32, out: &mut Emitter<u32>) -> Result<Disposition, String> {
        if n == 13 {
            return Err("unlucky".into());
        }
        if n % 2 == 0 {
            out.emit(n);
        } else {
            out.emit_to(Route::Secondary, n);
        }
        Ok(Disposition::Complete)
    }

    async fn post_process(&mut self) {
        self.post_process_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Holds inputs until three are buffered, then emits their sum.
struct Summer {
    buffer: Vec<u32>,
    flushed: bool,
    idle_flush: bool,
}

impl Summer {
    fn new(idle_flush: bool) -> Self {
        Self { buffer: Vec::new(), flushed: false, idle_flush }
    }
}

#[async_trait]
impl Stage for Summer {
    type Input = u32;
    type Output = u32;
    type Error = String;

    fn name(&self) -> &str {
        "summer"
    }

    fn message_key(&self, output: &u32) -> String {
        format!("sum-{output}")
    }

    async fn process(&mut self, n: u32, out: &mut Emitter<u32>) -> Result<Disposition, String> {
        self.buffer.push(n);
        if self.buffer.len() < 3 {
            return Ok(Disposition::Held);
        }
        out.emit(self.buffer.iter().sum());
        self.flushed = true;
        Ok(Disposition::Released)
    }

    async fn post_process(&mut self) {
        if self.flushed {
            self.buffer.clear();
            self.flushed = false;
        }
    }

    async fn on_idle(&mut self, out: &mut Emitter<u32>) -> Result<bool, String> {
        if !self.idle_flush || self.buffer.is_empty() {
            return Ok(false);
        }
        out.emit(self.buffer.iter().sum());
        self.flushed = true;
        Ok(true)
    }
}

#[tokio::test]
async fn routes_outputs_and_acks_inputs() {
    let conveyor = conveyor();
    let input = conveyor.channel(ChannelName::Records);
    let calls = Arc::new(AtomicUsize::new(0));
    let mut worker = WorkerBuilder::new("router", input.clone())
        .primary(conveyor.channel(ChannelName::NewJobs))
        .secondary(conveyor.channel(ChannelName::OldJobs))
        .poll_wait(WAIT)
        .build(Router { post_process_calls: calls.clone() }, conveyor.readiness());
    worker.start().await.unwrap();

    for n in [2u32, 3, 4] {
        input.produce(&format!("in-{n}"), &n).await.unwrap();
    }
    for _ in 0..3 {
        assert_eq!(worker.step().await.unwrap(), StepOutcome::Completed);
    }

    assert_eq!(
        input.counts().await.unwrap(),
        ChannelCounts { produced: 3, consumed: 3, cached: 0 }
    );
    assert_eq!(conveyor.channel(ChannelName::NewJobs).produced().await.unwrap(), 2);
    assert_eq!(conveyor.channel(ChannelName::OldJobs).produced().await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let out = conveyor.channel(ChannelName::OldJobs).consume(WAIT).await.unwrap().unwrap();
    assert_eq!(out.message.key, "n-3");
}

#[tokio::test]
async fn failed_process_is_redelivered_and_post_process_still_runs() {
    let conveyor = conveyor();
    let input = conveyor.channel(ChannelName::Records);
    let calls = Arc::new(AtomicUsize::new(0));
    let mut worker = WorkerBuilder::new("router", input.clone())
        .primary(conveyor.channel(ChannelName::NewJobs))
        .secondary(conveyor.channel(ChannelName::OldJobs))
        .poll_wait(WAIT)
        .build(Router { post_process_calls: calls.clone() }, conveyor.readiness());

    input.produce("in-13", &13u32).await.unwrap();
    assert_eq!(worker.step().await.unwrap(), StepOutcome::Redeliver);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(input.consumed().await.unwrap(), 0);

    // Redelivered on the next poll with a bumped attempt.
    let again = input.consume(WAIT).await.unwrap().unwrap();
    assert_eq!(again.attempt, 2);
}

#[tokio::test]
async fn held_inputs_stay_unacked_until_released() {
    let conveyor = conveyor();
    let input = conveyor.channel(ChannelName::NewJobs);
    let mut worker = WorkerBuilder::new("summer", input.clone())
        .primary(conveyor.channel(ChannelName::Normalized))
        .poll_wait(WAIT)
        .build(Summer::new(false), conveyor.readiness());

    for n in 1u32..=3 {
        input.produce(&format!("in-{n}"), &n).await.unwrap();
    }

    assert_eq!(worker.step().await.unwrap(), StepOutcome::Held);
    assert_eq!(worker.step().await.unwrap(), StepOutcome::Held);
    let counts = input.counts().await.unwrap();
    assert_eq!(counts, ChannelCounts { produced: 3, consumed: 0, cached: 2 });
    assert!(!counts.is_drained());
    assert_eq!(worker.held_len(), 2);

    assert_eq!(worker.step().await.unwrap(), StepOutcome::Released);
    assert_eq!(worker.held_len(), 0);
    assert!(input.counts().await.unwrap().is_drained());

    let out = conveyor.channel(ChannelName::Normalized);
    let sum = out.consume(WAIT).await.unwrap().unwrap();
    assert_eq!(sum.message.decode::<u32>().unwrap(), 6);
}

#[tokio::test]
async fn idle_poll_flushes_partial_buffer() {
    let conveyor = conveyor();
    let input = conveyor.channel(ChannelName::NewJobs);
    let mut worker = WorkerBuilder::new("summer", input.clone())
        .primary(conveyor.channel(ChannelName::Normalized))
        .poll_wait(WAIT)
        .build(Summer::new(true), conveyor.readiness());

    input.produce("in-5", &5u32).await.unwrap();
    assert_eq!(worker.step().await.unwrap(), StepOutcome::Held);
    assert_eq!(worker.step().await.unwrap(), StepOutcome::Flushed);
    assert!(input.counts().await.unwrap().is_drained());
    assert_eq!(worker.step().await.unwrap(), StepOutcome::Idle);
    assert_eq!(conveyor.channel(ChannelName::Normalized).produced().await.unwrap(), 1);
}

#[tokio::test]
async fn emitting_without_a_wired_channel_returns_input() {
    let conveyor = conveyor();
    let input = conveyor.channel(ChannelName::Records);
    let mut worker = WorkerBuilder::new("router", input.clone())
        .primary(conveyor.channel(ChannelName::NewJobs))
        .poll_wait(WAIT)
        .build(
            Router { post_process_calls: Arc::new(AtomicUsize::new(0)) },
            conveyor.readiness(),
        );

    input.produce("in-7", &7u32).await.unwrap();
    assert!(worker.step().await.is_err());
    assert_eq!(input.consumed().await.unwrap(), 0);
    assert!(input.consume(WAIT).await.unwrap().is_some());
}

#[tokio::test]
async fn undecodable_payload_is_dropped() {
    let conveyor = conveyor();
    let input = conveyor.channel(ChannelName::Records);
    let mut worker = WorkerBuilder::new("router", input.clone())
        .primary(conveyor.channel(ChannelName::NewJobs))
        .poll_wait(WAIT)
        .build(
            Router { post_process_calls: Arc::new(AtomicUsize::new(0)) },
            conveyor.readiness(),
        );

    input.produce("text", "not a number").await.unwrap();
    assert_eq!(worker.step().await.unwrap(), StepOutcome::Dropped);
    assert!(input.counts().await.unwrap().is_drained());
}

/// Records the readiness count it saw while initializing.
struct InitProbe {
    conveyor: Conveyor,
    seen_at_init: Arc<AtomicUsize>,
}

#[async_trait]
impl Stage for InitProbe {
    type Input = u32;
    type Output = u32;
    type Error = String;

    fn name(&self) -> &str {
        "probe"
    }

    async fn init(&mut self) -> Result<(), String> {
        let ready = self.conveyor.readiness().count("probe").await.map_err(|e| e.to_string())?;
        self.seen_at_init.store(ready as usize, Ordering::SeqCst);
        Ok(())
    }

    fn message_key(&self, output: &u32) -> String {
        output.to_string()
    }

    async fn process(&mut self, _n: u32, _out: &mut Emitter<u32>) -> Result<Disposition, String> {
        Ok(Disposition::Complete)
    }
}

#[tokio::test]
async fn readiness_is_registered_after_init() {
    let conveyor = conveyor();
    let seen = Arc::new(AtomicUsize::new(usize::MAX));
    let mut worker = WorkerBuilder::new("probe", conveyor.channel(ChannelName::Enriched)).build(
        InitProbe { conveyor: conveyor.clone(), seen_at_init: seen.clone() },
        conveyor.readiness(),
    );
    worker.start().await.unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 0);
    assert_eq!(conveyor.readiness().count("probe").await.unwrap(), 1);
}

#[tokio::test]
async fn run_stops_on_shutdown_and_returns_held() {
    let conveyor = conveyor();
    let input = conveyor.channel(ChannelName::NewJobs);
    let worker = WorkerBuilder::new("summer", input.clone())
        .primary(conveyor.channel(ChannelName::Normalized))
        .poll_wait(WAIT)
        .build(Summer::new(false), conveyor.readiness());
    let (tx, rx) = watch::channel(false);

    input.produce("in-1", &1u32).await.unwrap();
    let handle = tokio::spawn(worker.run(rx));

    // Wait until the input is held.
    for _ in 0..100 {
        if input.cached().await.unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(input.cached().await.unwrap(), 1);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker should stop")
        .expect("join")
        .unwrap();

    assert_eq!(input.consumed().await.unwrap(), 0);
    assert!(input.consume(WAIT).await.unwrap().is_some());
}
