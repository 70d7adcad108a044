//! psrpipe - pulsar-search pipeline stage consumer.
//!
//! One process consumes one stage's queue. Horizontal scale-out is
//! running more processes against the same queue directory.
//!
//! # Usage
//!
//! ```bash
//! # Consume the acceleration-search queue
//! psrpipe --stage search --queue-dir /data/queues
//!
//! # Custom configuration and queue name
//! psrpipe --stage fold --queue-dir /data/queues \
//!     --config pipeline.toml --input-queue presto_fold_gpu
//!
//! # Process what is queued right now, then exit
//! psrpipe --stage merge --queue-dir /data/queues --drain
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Logging level (default: info)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use psrpipe::invoker::ProcessInvoker;
use psrpipe::pipeline::Coordinator;
use psrpipe::queue::DirQueue;
use psrpipe::registry::MemoryRegistry;
use psrpipe::types::StageKind;
use psrpipe::PipelineConfig;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "psrpipe")]
#[command(about = "Pulsar-search pipeline stage consumer")]
#[command(version)]
struct CliArgs {
    /// Stage to consume: merge, search, fold, or score
    #[arg(long, value_parser = parse_stage)]
    stage: StageKind,

    /// Root directory of the work queues
    #[arg(long, env = "PSRPIPE_QUEUE_DIR")]
    queue_dir: PathBuf,

    /// Pipeline configuration file (TOML); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the input queue name for this stage
    #[arg(long)]
    input_queue: Option<String>,

    /// Poll interval in milliseconds when the queue is empty
    #[arg(long, default_value_t = 2000)]
    poll_ms: u64,

    /// Consume what is queued now and exit instead of running forever
    #[arg(long)]
    drain: bool,
}

fn parse_stage(value: &str) -> Result<StageKind, String> {
    match value {
        "merge" => Ok(StageKind::Merge),
        "search" => Ok(StageKind::Search),
        "fold" => Ok(StageKind::Fold),
        "score" => Ok(StageKind::Score),
        other => Err(format!(
            "unknown stage {other:?}, expected merge, search, fold, or score"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let config = Arc::new(config);

    let queue = Arc::new(DirQueue::new(&args.queue_dir));
    let registry = Arc::new(MemoryRegistry::new());
    let invoker = Arc::new(ProcessInvoker::new(config.tool_timeout()));

    let coordinator = Coordinator::new(
        args.stage,
        queue,
        registry,
        invoker,
        config,
        args.input_queue.clone(),
    );

    if args.drain {
        let stats = coordinator.drain().await?;
        info!(%stats, "drain complete");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    coordinator
        .run(cancel, Duration::from_millis(args.poll_ms))
        .await?;
    Ok(())
}
