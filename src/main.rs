//! S3 Shuttle - resumable cross-account S3 object migration

use aws_config::BehaviorVersion;
use clap::{Parser, Subcommand};
use s3_shuttle::bookkeeping::DynamoTable;
use s3_shuttle::config::{Config, TransferDirection};
use s3_shuttle::credentials::PeerCredentials;
use s3_shuttle::engine::{Engine, EngineSettings};
use s3_shuttle::producer::{Producer, ProducerParams};
use s3_shuttle::queue::SqsQueue;
use s3_shuttle::storage::{ObjectStore, S3Store};
use s3_shuttle::worker::JobWorker;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Version string including build timestamp for --version output
fn version_long() -> &'static str {
    // e.g. "0.4.2 (built 2026-07-30T08:12:45Z)"
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!(
            "{} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("S3SH_BUILD_TIME"),
        )
    })
}

/// S3 Shuttle — resumable cross-account S3 object migration
#[derive(Parser, Debug)]
#[command(name = "s3_shuttle")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker loop: lease jobs from the queue and transfer objects
    Worker,
    /// List the source prefix, compute the delta, and enqueue jobs
    Producer {
        /// Source bucket (overrides config)
        #[arg(long)]
        src_bucket: Option<String>,
        /// Source prefix (overrides config)
        #[arg(long)]
        src_prefix: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from file if specified, otherwise use default loading
    let config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()
    };

    // Initialize tracing. Priority: RUST_LOG > logging_level config > --verbose > default
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("s3_shuttle=trace")
        } else {
            EnvFilter::new(format!("s3_shuttle={}", config.logging_level))
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "Starting S3 Shuttle v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("S3SH_BUILD_TIME"),
    );
    info!("  Queue: {}", config.queue_name);
    info!("  Table: {}", config.table_name);
    info!("  Chunk size: {} bytes", config.chunk_size);
    info!("  Max concurrency: {}", config.max_concurrency);
    info!("  Job timeout: {} s", config.job_timeout);
    info!("  Verify digest twice: {}", config.verify_digest_twice);

    // Control-plane clients (queue, table, secret store) live in the local
    // trust domain alongside whichever S3 side uses the default chain
    let local_region = match config.transfer_direction {
        TransferDirection::Put => config.source.region.clone(),
        TransferDirection::Get => config.destination.region.clone(),
    };
    let control_plane = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(local_region))
        .load()
        .await;

    // Peer credentials: SSM parameter when configured, environment otherwise
    let peer = if let Some(ref parameter) = config.ssm_parameter_credentials {
        let ssm = aws_sdk_ssm::Client::new(&control_plane);
        PeerCredentials::from_ssm(&ssm, parameter).await?
    } else {
        PeerCredentials::from_env()?
    };

    let (source, destination): (Arc<dyn ObjectStore>, Arc<dyn ObjectStore>) =
        match config.transfer_direction {
            TransferDirection::Put => (
                Arc::new(S3Store::new(&config.source, None).await),
                Arc::new(S3Store::new(&config.destination, Some(peer.to_sdk())).await),
            ),
            TransferDirection::Get => (
                Arc::new(S3Store::new(&config.source, Some(peer.to_sdk())).await),
                Arc::new(S3Store::new(&config.destination, None).await),
            ),
        };

    let table = Arc::new(DynamoTable::new(
        aws_sdk_dynamodb::Client::new(&control_plane),
        config.table_name.clone(),
    ));
    let queue = Arc::new(
        SqsQueue::connect(aws_sdk_sqs::Client::new(&control_plane), &config.queue_name).await,
    );

    match cli.command {
        Command::Worker => {
            let worker_id = config
                .worker_id
                .clone()
                .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
            let engine = Arc::new(Engine::new(
                source,
                destination,
                table.clone(),
                EngineSettings::from_config(&config),
                worker_id,
            ));
            let worker = JobWorker::new(
                engine,
                queue,
                table,
                config.des_bucket_default.clone(),
                config.des_prefix_default.clone(),
                config.max_retry,
            );

            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    shutdown_signal().await;
                    shutdown.cancel();
                }
            });

            worker.run(shutdown).await;
            info!("Worker shutdown complete");
        }
        Command::Producer {
            src_bucket,
            src_prefix,
        } => {
            let params = ProducerParams {
                src_bucket: src_bucket.unwrap_or_else(|| config.src_bucket.clone()),
                src_prefix: src_prefix.unwrap_or_else(|| config.src_prefix.clone()),
                des_bucket: config.des_bucket_default.clone(),
                des_prefix: config.des_prefix_default.clone(),
                max_retry: config.max_retry,
            };
            if params.src_bucket.is_empty() || params.des_bucket.is_empty() {
                return Err("producer requires src_bucket and des_bucket_default".into());
            }

            let producer = Producer::new(source, destination, queue, table, params);
            let enqueued = producer.run().await?;
            info!(enqueued, "Producer run complete");
        }
    }

    Ok(())
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
