//! Controller cycles over in-memory channels with a paused clock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobflow_conveyor::{ChannelName, Conveyor, FeedTask};
use jobflow_core::config::MasterConfig;
use jobflow_core::pipeline_file::REQUIRED_WORKER_TYPES;
use jobflow_core::{FeedKind, FeedSource, JobDocument, PipelineFile};
use jobflow_master::{MasterController, Observation, Phase};
use jobflow_queue::{MemoryQueue, MemoryStore};
use jobflow_stages::{BulkSummary, CleanupSummary, DocumentStore, StageError};
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Default)]
struct FakeIndex {
    cleanups: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl DocumentStore for FakeIndex {
    async fn bulk_upsert(&self, docs: &[JobDocument]) -> Result<BulkSummary, StageError> {
        Ok(BulkSummary {
            indexed: docs.len(),
            failed: 0,
        })
    }

    async fn delete_stale(&self, token: &str) -> Result<CleanupSummary, StageError> {
        self.cleanups.lock().unwrap().push(token.to_string());
        if self.fail {
            return Err(StageError::DocumentStore("index unavailable".into()));
        }
        Ok(CleanupSummary {
            deleted: 3,
            total: 10,
        })
    }
}

fn master_config() -> MasterConfig {
    MasterConfig {
        interval_secs: 10,
        settle_secs: 30,
        max_idle_secs: 600,
        rerun_wait_secs: 900,
        idle_sleep_secs: 60,
    }
}

fn pipeline() -> PipelineFile {
    let workers: BTreeMap<String, u32> = REQUIRED_WORKER_TYPES
        .iter()
        .map(|w| (w.to_string(), 1))
        .collect();
    let feeds = ["ac", "rj"]
        .iter()
        .enumerate()
        .map(|(i, name)| FeedSource {
            name: name.to_string(),
            kind: FeedKind::Appcast,
            url: format!("http://feeds.local/{name}"),
            order: i as u32,
        })
        .collect();
    PipelineFile { workers, feeds }
}

struct Harness {
    controller: MasterController,
    conveyor: Conveyor,
    index: Arc<FakeIndex>,
    shutdown: watch::Sender<bool>,
}

fn harness(index: FakeIndex) -> Harness {
    let conveyor = Conveyor::new(
        Arc::new(MemoryQueue::new()),
        Arc::new(MemoryStore::new()),
        "m",
    );
    let index = Arc::new(index);
    let (shutdown, rx) = watch::channel(false);
    let controller = MasterController::new(
        conveyor.clone(),
        pipeline(),
        master_config(),
        index.clone(),
        rx,
    );
    Harness {
        controller,
        conveyor,
        index,
        shutdown,
    }
}

async fn register_all(conveyor: &Conveyor) {
    for worker in REQUIRED_WORKER_TYPES {
        conveyor.readiness().register(worker).await.unwrap();
    }
}

/// Consume and ack every queued feed task, as a fetch worker would.
async fn drain_feeds(conveyor: &Conveyor) {
    let feeds = conveyor.channel(ChannelName::Feeds);
    while let Some(delivery) = feeds.consume(Duration::ZERO).await.unwrap() {
        let task: FeedTask = delivery.message.decode().unwrap();
        assert!(!task.process_seq.is_empty());
        assert!(feeds.ack(&delivery).await.unwrap());
    }
}

#[tokio::test(start_paused = true)]
async fn init_waits_for_every_worker_type_then_settles() {
    let mut h = harness(FakeIndex::default());
    let conveyor = h.conveyor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(25)).await;
        register_all(&conveyor).await;
    });

    let start = Instant::now();
    assert!(h.controller.step().await.unwrap());

    assert_eq!(h.controller.phase(), Phase::Setup);
    // The poll at 30s sees everyone, then the 30s settle.
    assert!(start.elapsed() >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn init_blocks_until_old_jobs_has_a_consumer() {
    let mut h = harness(FakeIndex::default());
    for worker in REQUIRED_WORKER_TYPES.iter().filter(|w| **w != "normalize-old") {
        h.conveyor.readiness().register(worker).await.unwrap();
    }
    // Extra new_jobs normalizers do not stand in for the old_jobs one.
    h.conveyor.readiness().register("normalize").await.unwrap();

    let conveyor = h.conveyor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(100)).await;
        let worker = ChannelName::OldJobs.consumer_worker_type();
        conveyor.readiness().register(worker).await.unwrap();
    });

    let start = Instant::now();
    assert!(h.controller.step().await.unwrap());

    assert_eq!(h.controller.phase(), Phase::Setup);
    assert!(start.elapsed() >= Duration::from_secs(130));
}

#[tokio::test(start_paused = true)]
async fn setup_seeds_feeds_under_a_new_token() {
    let mut h = harness(FakeIndex::default());
    let store = h.conveyor.store().clone();
    let keys = h.conveyor.keys().clone();

    // Leftovers from a previous run.
    store.incr_by(&keys.report("norm-error"), 4).await.unwrap();
    h.conveyor
        .channel(ChannelName::Records)
        .produce("stale-1", &1u32)
        .await
        .unwrap();

    let token = h.controller.handle_setup().await.unwrap();

    let stored = store.get(&keys.process_seq()).await.unwrap();
    assert_eq!(stored.as_deref(), Some(token.as_str()));
    assert_eq!(h.conveyor.reports().get("norm-error").await.unwrap(), 0);
    for channel in h.conveyor.channels() {
        let counts = channel.counts().await.unwrap();
        let expected = if channel.name() == ChannelName::Feeds { 2 } else { 0 };
        assert_eq!(counts.produced, expected, "{}", channel.name());
        assert_eq!(counts.consumed, 0);
        assert_eq!(counts.cached, 0);
    }
    assert!(h
        .conveyor
        .channel(ChannelName::Records)
        .consume(Duration::ZERO)
        .await
        .unwrap()
        .is_none());

    let feeds = h.conveyor.channel(ChannelName::Feeds);
    let first: FeedTask = feeds
        .consume(Duration::ZERO)
        .await
        .unwrap()
        .unwrap()
        .message
        .decode()
        .unwrap();
    assert_eq!(first.source.name, "ac");
    assert_eq!(first.process_seq, token);
    assert_eq!(h.controller.run_state().unwrap().topic_check_index, 0);
}

#[tokio::test(start_paused = true)]
async fn monitor_finishes_on_drain() {
    let mut h = harness(FakeIndex::default());
    h.controller.handle_setup().await.unwrap();

    let records = h.conveyor.channel(ChannelName::Records);
    records.produce("r-1", &1u32).await.unwrap();
    drain_feeds(&h.conveyor).await;

    let conveyor = h.conveyor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15)).await;
        let records = conveyor.channel(ChannelName::Records);
        let delivery = records.consume(Duration::ZERO).await.unwrap().unwrap();
        records.ack(&delivery).await.unwrap();
    });

    let observation = h.controller.handle_monitor().await.unwrap();
    assert_eq!(observation, Some(Observation::Drained));
    let run = h.controller.run_state().unwrap();
    assert_eq!(run.topic_check_index, ChannelName::ALL.len());
    assert!(run.idle_since.is_none());
}

#[tokio::test(start_paused = true)]
async fn monitor_finishes_on_stall_with_undrained_channel() {
    let mut h = harness(FakeIndex::default());
    h.controller.handle_setup().await.unwrap();
    // Nobody consumes the feed tasks.

    let start = Instant::now();
    let observation = h.controller.handle_monitor().await.unwrap();

    assert!(matches!(
        observation,
        Some(Observation::Stalled { idle }) if idle > Duration::from_secs(600)
    ));
    assert!(start.elapsed() > Duration::from_secs(600));
    let run = h.controller.run_state().unwrap();
    assert_eq!(run.topic_check_index, 0);
    assert!(run.idle_since.is_some());
}

#[tokio::test(start_paused = true)]
async fn full_cycle_changes_token_and_resets_counters() {
    let mut h = harness(FakeIndex::default());
    register_all(&h.conveyor).await;

    assert!(h.controller.step().await.unwrap());
    assert_eq!(h.controller.phase(), Phase::Setup);

    assert!(h.controller.step().await.unwrap());
    assert_eq!(h.controller.phase(), Phase::Monitor);
    let first = h.controller.run_state().unwrap().process_seq.clone();

    drain_feeds(&h.conveyor).await;
    assert!(h.controller.step().await.unwrap());
    assert_eq!(h.controller.phase(), Phase::Finish);

    assert!(h.controller.step().await.unwrap());
    assert_eq!(h.controller.phase(), Phase::Idle);
    assert_eq!(*h.index.cleanups.lock().unwrap(), vec![first.clone()]);
    assert!(h.controller.run_state().unwrap().task_finish.is_some());

    let idle_start = Instant::now();
    assert!(h.controller.step().await.unwrap());
    assert_eq!(h.controller.phase(), Phase::Setup);
    assert!(idle_start.elapsed() >= Duration::from_secs(900));

    assert!(h.controller.step().await.unwrap());
    assert_eq!(h.controller.phase(), Phase::Monitor);
    let second = h.controller.run_state().unwrap().process_seq.clone();
    assert_ne!(first, second);

    let feeds = h.conveyor.channel(ChannelName::Feeds).counts().await.unwrap();
    assert_eq!((feeds.produced, feeds.consumed, feeds.cached), (2, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn cleanup_failure_does_not_block_idle() {
    let mut h = harness(FakeIndex {
        fail: true,
        ..Default::default()
    });
    h.controller.handle_setup().await.unwrap();
    h.controller.handle_finish().await.unwrap();

    assert_eq!(h.index.cleanups.lock().unwrap().len(), 1);
    assert!(h.controller.run_state().unwrap().task_finish.is_some());
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_idle() {
    let mut h = harness(FakeIndex::default());
    h.controller.handle_setup().await.unwrap();
    h.controller.handle_finish().await.unwrap();

    let shutdown = h.shutdown;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(90)).await;
        let _ = shutdown.send(true);
    });

    let start = Instant::now();
    assert!(!h.controller.handle_idle().await);
    assert!(start.elapsed() < Duration::from_secs(900));
}
