//! master: drive pipeline runs forever.
//!
//! # Usage
//!
//! ```bash
//! master --pipeline config/jobflow.toml
//! JOBFLOW_PROFILE=PROD master
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use jobflow_conveyor::{shutdown_on_signal, Conveyor};
use jobflow_core::config::{load_dotenv, Config};
use jobflow_core::PipelineFile;
use jobflow_master::MasterController;
use jobflow_queue::redis::create_pool;
use jobflow_queue::{RedisQueue, RedisStore};
use jobflow_stages::OpenSearchStore;

/// Run controller for the job ingestion pipeline.
#[derive(Parser, Debug)]
#[command(name = "master", version, about)]
struct Cli {
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

    let pipeline = PipelineFile::from_file(&cli.pipeline)
        .with_context(|| format!("failed to load {}", cli.pipeline))?;
    tracing::info!(
        pipeline = %cli.pipeline,
        workers = pipeline.workers.len(),
        feeds = pipeline.feeds.len(),
        "pipeline loaded"
    );

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

    let controller = MasterController::new(
        conveyor,
        pipeline,
        config.master.clone(),
        Arc::new(OpenSearchStore::new(&config.opensearch)),
        shutdown_on_signal(),
    );
    controller.run_loop().await?;
    Ok(())
}
