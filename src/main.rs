//! `s3ftp`: projects a bucket onto the file-transfer root and keeps the two in step.

#[macro_use]
extern crate log;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use s3ftp::archive::Archive;
use s3ftp::config::{Ignore, RemoteConfig, SyncConfig};
use s3ftp::conflict::ConflictPolicy;
use s3ftp::projection::{ProjectionManager, ProjectionOptions};
use s3ftp::retry::RetryPolicy;
use s3ftp::scheduler::Scheduler;
use s3ftp::storage::{ObjectStoreClient, Storage};
use s3ftp::{ReconcileMode, Reconciler};

#[derive(Parser, Debug)]
#[command(name = "s3ftp", version, about)]
struct Cli {
    #[command(flatten)]
    remote: RemoteArgs,

    #[command(flatten)]
    sync: SyncArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Project the bucket, run a baseline pass, then keep passing until interrupted.
    Serve,
    /// Run a single pass and exit.
    Reconcile {
        #[arg(long, default_value = "incremental")]
        mode: ReconcileMode,
    },
    /// Release a projection left behind by a previous run.
    Teardown,
}

#[derive(Args, Debug)]
struct RemoteArgs {
    #[arg(long, env = "S3_BUCKET")]
    bucket: String,

    /// Custom endpoint for S3-compatible services.
    #[arg(long, env = "S3_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    region: String,

    #[arg(long, env = "S3_ACCESS_KEY_ID", hide_env_values = true)]
    access_key_id: Option<String>,

    #[arg(long, env = "S3_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_access_key: Option<String>,

    /// Only keys beneath this prefix are synchronized.
    #[arg(long, env = "S3_PREFIX")]
    prefix: Option<String>,

    #[arg(long, env = "S3_ALLOW_HTTP")]
    allow_http: bool,
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// The local root served to file-transfer sessions.
    #[arg(long, env = "S3FTP_ROOT", default_value = "/home")]
    root: PathBuf,

    /// Where baselines and projection markers are kept.
    #[arg(long, env = "S3FTP_STATE_DIR", default_value = "/var/lib/s3ftp")]
    state_dir: PathBuf,

    #[arg(long, env = "SYNC_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    interval: Duration,

    #[arg(long, env = "SYNC_PARALLELISM", default_value_t = 4)]
    parallelism: usize,

    #[arg(long, env = "SYNC_MAX_FAILURES", default_value_t = 16)]
    max_failures: usize,

    /// Timeout for each storage request.
    #[arg(long, env = "SYNC_OP_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    op_timeout: Duration,

    #[arg(long, env = "SYNC_CONFLICT_POLICY", default_value = "preserve-both")]
    conflict_policy: ConflictPolicy,

    /// Comma-separated regexes of paths never synchronized.
    #[arg(long, env = "SYNC_IGNORE", value_delimiter = ',')]
    ignore: Vec<String>,

    /// Compare sizes only when deciding whether two files match. Files that differ
    /// only in content are then assumed identical on a first pass; files edited
    /// on both sides since the last pass are always treated as conflicts.
    #[arg(long, env = "SYNC_SKIP_CONTENT_COMPARISON")]
    skip_content_comparison: bool,

    /// Project onto a root that already has contents.
    #[arg(long, env = "S3FTP_ALLOW_NON_EMPTY")]
    allow_non_empty: bool,

    /// Let accounts other than the service's traverse the root.
    #[arg(long, env = "S3FTP_ALLOW_OTHER")]
    allow_other: bool,

    #[arg(long, env = "SYNC_HEALTH_INTERVAL", default_value = "30s", value_parser = humantime::parse_duration)]
    health_interval: Duration,
}

impl RemoteArgs {
    fn to_config(&self) -> RemoteConfig {
        RemoteConfig {
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            prefix: self.prefix.clone(),
            allow_http: self.allow_http,
        }
    }
}

impl SyncArgs {
    /// Checks the settings and turns them into a `SyncConfig`.
    fn to_config(&self) -> Result<SyncConfig, String> {
        if self.interval.is_zero() {
            return Err("SYNC_INTERVAL must be greater than zero".to_owned());
        }
        if self.parallelism == 0 {
            return Err("SYNC_PARALLELISM must be at least 1".to_owned());
        }
        if self.op_timeout.is_zero() {
            return Err("SYNC_OP_TIMEOUT must be greater than zero".to_owned());
        }

        let mut ignore = Ignore::default();
        for pattern in self.ignore.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            let regex = Regex::new(pattern).map_err(|e| format!("invalid ignore pattern {:?}: {}", pattern, e))?;
            ignore.regexes.push(regex);
        }

        Ok(SyncConfig {
            ignore,
            compare_file_contents: !self.skip_content_comparison,
            conflict_policy: self.conflict_policy,
            parallelism: self.parallelism,
            max_failures: self.max_failures,
            retry: RetryPolicy {
                timeout: self.op_timeout,
                ..Default::default()
            },
        })
    }

    fn projection_options(&self) -> ProjectionOptions {
        ProjectionOptions {
            allow_non_empty: self.allow_non_empty,
            allow_other: self.allow_other,
            detached: true,
            health_interval: self.health_interval,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let remote = cli.remote.to_config();
    if remote.bucket.trim().is_empty() {
        return Err("S3_BUCKET must not be empty".to_owned());
    }
    let config = cli.sync.to_config()?;
    debug!("Remote: {:?}", remote);

    let state_dir = &cli.sync.state_dir;
    let manager = ProjectionManager::new(state_dir.join("projections"))
        .map_err(|e| format!("failed to prepare {:?}: {}", state_dir, e))?;

    if let Command::Teardown = cli.command {
        return manager.teardown(&cli.sync.root).await.map_err(|e| e.to_string());
    }

    let storage: Storage = Arc::new(ObjectStoreClient::s3(&remote).map_err(|e| e.to_string())?);
    let archive = Archive::new(state_dir.join("baselines")).map_err(|e| format!("failed to prepare {:?}: {}", state_dir, e))?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted; finishing in-flight operations");
            interrupt.cancel();
        }
    });

    match cli.command {
        Command::Reconcile { mode } => {
            let reconciler = Reconciler::new(storage, archive, config);
            reconciler
                .reconcile_with_cancel(&cli.sync.root, mode, &cancel)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
        Command::Serve => serve(storage, archive, config, &manager, &cli.sync, cancel).await,
        Command::Teardown => Ok(()),
    }
}

async fn serve(
    storage: Storage,
    archive: Archive,
    config: SyncConfig,
    manager: &ProjectionManager,
    args: &SyncArgs,
    cancel: CancellationToken,
) -> Result<(), String> {
    let root: &Path = &args.root;
    info!(
        "Starting: projecting {} onto {:?}, passes every {}",
        storage.describe(),
        root,
        humantime::format_duration(args.interval)
    );

    let projection = manager
        .establish(storage.clone(), root, &args.projection_options())
        .await
        .map_err(|e| e.to_string())?;
    let reconciler = Arc::new(Reconciler::new(storage, archive, config).with_projection(projection));
    let mut scheduler = Scheduler::new(reconciler, root.to_path_buf(), args.interval, cancel);

    let result = match scheduler.initial_pass().await {
        Ok(_) => scheduler.run().await.map_err(|e| e.to_string()),
        Err(e) => Err(format!("initial baseline pass failed: {}", e)),
    };

    if let Err(e) = manager.teardown(root).await {
        warn!("Failed to release projection of {:?}: {}", root, e);
    }
    result
}
