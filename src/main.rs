use anyhow::{Context, Result};
use bucketsync::core::enumerator::normalize_prefix;
use bucketsync::core::{Direction, Orchestrator, TransferRequest};
use bucketsync::{config, context, logging};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "bucketsync")]
#[command(about = "Sync model directories to and from an object store bucket", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $BUCKETSYNC_CONFIG, then ./bucketsync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the in-memory simulated store instead of a real one
    #[arg(long, global = true)]
    simulation: bool,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download everything under the model path into the local registry
    Download(SyncArgs),
    /// Upload the local model directory to the model path
    Upload(SyncArgs),
}

#[derive(Args)]
struct SyncArgs {
    /// Path of the model inside the bucket
    #[arg(long, default_value = "")]
    model_path: String,

    /// Local registry root; the model path is joined onto it
    #[arg(long)]
    local_path: Option<PathBuf>,

    #[arg(long)]
    bucket: Option<String>,

    /// S3 endpoint, `host:port` or a full URL (defaults to $MINIO_ENDPOINT)
    #[arg(long)]
    endpoint: Option<String>,

    /// Sync against a local directory instead of an S3 endpoint
    #[arg(long)]
    store_root: Option<PathBuf>,

    /// Publish progress to a ConfigMap in the current cluster
    #[arg(long)]
    use_kubernetes: bool,

    #[arg(long)]
    namespace: Option<String>,

    #[arg(long)]
    configmap_name: Option<String>,

    /// Number of concurrent transfers
    #[arg(long)]
    workers: Option<usize>,
}

/// Only flags that were actually given end up in the merged config.
#[derive(Serialize, Default)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    local_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_logs: Option<bool>,
    store: StoreOverrides,
    status: StatusOverrides,
    transfer: TransferOverrides,
}

#[derive(Serialize, Default)]
struct StoreOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<config::StoreBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
}

#[derive(Serialize, Default)]
struct StatusOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    sink: Option<config::StatusSinkType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record_name: Option<String>,
}

#[derive(Serialize, Default)]
struct TransferOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    workers: Option<usize>,
}

impl Overrides {
    fn new(cli: &Cli, args: &SyncArgs) -> Self {
        Self {
            local_path: args.local_path.clone(),
            verbose: cli.verbose.then_some(true),
            json_logs: cli.json_logs.then_some(true),
            store: StoreOverrides {
                backend: if cli.simulation {
                    Some(config::StoreBackend::Simulated)
                } else {
                    args.store_root.as_ref().map(|_| config::StoreBackend::Fs)
                },
                root: args.store_root.clone(),
                bucket: args.bucket.clone(),
                endpoint: args.endpoint.clone(),
            },
            status: StatusOverrides {
                sink: args.use_kubernetes.then_some(config::StatusSinkType::Kubernetes),
                namespace: args.namespace.clone(),
                record_name: args.configmap_name.clone(),
            },
            transfer: TransferOverrides {
                workers: args.workers,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let (direction, args) = match &cli.command {
        Commands::Download(args) => (Direction::Download, args),
        Commands::Upload(args) => (Direction::Upload, args),
    };

    let overrides = Overrides::new(&cli, args);
    let config = config::AppConfig::new(cli.config.as_deref(), Some(&overrides))?;
    logging::init(logging::LogConfig::from(&config))?;

    let prefix = normalize_prefix(&args.model_path);
    let local_root = match prefix.trim_end_matches('/') {
        "" => config.local_path.clone(),
        model => config.local_path.join(model),
    };

    let ctx = context::AppContext::new(config).context("Failed to initialize")?;
    info!("{}ing models from/to {}", direction.title(), ctx.config.store.bucket);

    let request = TransferRequest {
        direction,
        prefix,
        local_root,
    };

    match Orchestrator::new(&ctx).run(&request).await {
        Ok(report) if report.overall_success => Ok(ExitCode::SUCCESS),
        Ok(report) => {
            error!(
                failed = report.failed_items.len(),
                total = report.total,
                "Sync finished with failures"
            );
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "Sync aborted");
            Ok(ExitCode::FAILURE)
        }
    }
}

