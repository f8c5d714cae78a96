//! stage-worker: run one pipeline stage against the shared queue and store.
//!
//! # Usage
//!
//! ```bash
//! stage-worker --stage clean
//! stage-worker --stage normalize --input old_jobs
//! JOBFLOW_PROFILE=PROD stage-worker --stage sink
//! ```

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use jobflow_conveyor::{shutdown_on_signal, ChannelName, Conveyor, Stage, WorkerBuilder};
use jobflow_core::config::{load_dotenv, Config};
use jobflow_core::PipelineFile;
use jobflow_queue::redis::create_pool;
use jobflow_queue::{RedisQueue, RedisStore};
use jobflow_stages::{
    BatchRetryProcessor, CleanStage, EnrichStage, FetchStage, HttpClassifier, HttpFeedReader,
    OpenSearchStore, SinkStage, StoreIdentity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StageKind {
    Fetch,
    Clean,
    Normalize,
    Enrich,
    Sink,
}

impl StageKind {
    fn default_input(self) -> ChannelName {
        match self {
            StageKind::Fetch => ChannelName::Feeds,
            StageKind::Clean => ChannelName::Records,
            StageKind::Normalize => ChannelName::NewJobs,
            StageKind::Enrich => ChannelName::Normalized,
            StageKind::Sink => ChannelName::Enriched,
        }
    }

    fn accepts(self, input: ChannelName) -> bool {
        match self {
            StageKind::Normalize => matches!(input, ChannelName::NewJobs | ChannelName::OldJobs),
            other => other.default_input() == input,
        }
    }
}

fn parse_channel(s: &str) -> Result<ChannelName, String> {
    ChannelName::from_str(s).map_err(|e| e.to_string())
}

/// Run one stage of the job ingestion pipeline.
#[derive(Parser, Debug)]
#[command(name = "stage-worker", version, about)]
struct Cli {
    /// Stage to run.
    #[arg(long, value_enum, env = "JOBFLOW_STAGE")]
    stage: StageKind,

    /// Input channel (defaults to the stage's usual predecessor).
    #[arg(long, env = "JOBFLOW_INPUT", value_parser = parse_channel)]
    input: Option<ChannelName>,

    /// Pipeline file with worker requirements and feed sources.
    #[arg(long, env = "JOBFLOW_PIPELINE", default_value = "config/jobflow.toml")]
    pipeline: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let input = cli.input.unwrap_or_else(|| cli.stage.default_input());
    if !cli.stage.accepts(input) {
        bail!("stage {:?} cannot consume from {input}", cli.stage);
    }

    let pool = create_pool(&config.redis.url).context("failed to create redis pool")?;
    let conveyor = Conveyor::new(
        Arc::new(RedisQueue::new(pool.clone(), &config.redis.namespace)),
        Arc::new(RedisStore::new(pool)),
        config.redis.namespace.clone(),
    );
    let health = conveyor
        .queue()
        .health_check()
        .await
        .context("queue health check failed")?;
    tracing::info!(%health, "queue reachable");

    // Readiness is registered per input so `new_jobs` and `old_jobs` each need a consumer.
    let worker_type = input.consumer_worker_type();
    let builder = WorkerBuilder::new(worker_type, conveyor.channel(input))
        .poll_wait(config.worker.poll_wait());

    tracing::info!(stage = ?cli.stage, worker_type, input = %input, "starting stage-worker");

    match cli.stage {
        StageKind::Fetch => {
            let stage = FetchStage::new(
                Arc::new(HttpFeedReader::new(config.worker.feed_timeout())),
                conveyor.store().clone(),
                conveyor.keys().clone(),
                conveyor.channel(ChannelName::Records),
                conveyor.reports(),
            );
            let builder = builder.primary(conveyor.channel(ChannelName::Records));
            run(builder, stage, &conveyor).await
        }
        StageKind::Clean => {
            let pipeline = PipelineFile::from_file(&cli.pipeline)
                .with_context(|| format!("failed to load {}", cli.pipeline))?;
            let identity = Arc::new(StoreIdentity::new(
                conveyor.store().clone(),
                conveyor.keys().clone(),
            ));
            let stage = CleanStage::new(
                &pipeline.feeds,
                config.worker.desc_max_len,
                identity,
                conveyor.reports(),
            );
            let builder = builder
                .primary(conveyor.channel(ChannelName::NewJobs))
                .secondary(conveyor.channel(ChannelName::OldJobs));
            run(builder, stage, &conveyor).await
        }
        StageKind::Normalize => {
            let classifier = Arc::new(HttpClassifier::new(
                config.classifier.url.clone(),
                config.classifier.timeout(),
            ));
            let stage = BatchRetryProcessor::new(
                classifier,
                conveyor.store().clone(),
                conveyor.keys().clone(),
                conveyor.reports(),
                &config.classifier,
                config.worker.idle_flush(),
            );
            let builder = builder.primary(conveyor.channel(ChannelName::Normalized));
            run(builder, stage, &conveyor).await
        }
        StageKind::Enrich => {
            let stage = EnrichStage::new(
                conveyor.store().clone(),
                conveyor.keys().clone(),
                conveyor.reports(),
            );
            let builder = builder.primary(conveyor.channel(ChannelName::Enriched));
            run(builder, stage, &conveyor).await
        }
        StageKind::Sink => {
            let stage = SinkStage::new(
                Arc::new(OpenSearchStore::new(&config.opensearch)),
                conveyor.reports(),
                config.opensearch.batch_size,
                config.worker.idle_flush(),
            );
            run(builder, stage, &conveyor).await
        }
    }
}

async fn run<S: Stage>(
    builder: WorkerBuilder,
    stage: S,
    conveyor: &Conveyor,
) -> anyhow::Result<()> {
    let worker = builder.build(stage, conveyor.readiness());
    worker.run(shutdown_on_signal()).await?;
    Ok(())
}
