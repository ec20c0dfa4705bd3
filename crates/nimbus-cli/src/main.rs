//! NimbusFS command-line interface.
//!
//! `nimbusfs mount <path>` is the process entry surface: it loads the
//! configuration, applies flag overrides for the recognized keys,
//! assembles the engine, and serves until SIGINT/SIGTERM. Exit code
//! is non-zero on mount failure and 0 after a clean unmount.
//!
//! Authentication is an external collaborator: the token file under
//! the account cache directory must already exist (placed there by
//! the embedder's auth flow); this process only refreshes it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nimbus_core::config::{Config, ConflictPolicy};
use nimbus_core::context::NimbusContext;
use nimbus_core::ports::realtime_link::RealtimeLink;
use nimbus_core::ports::remote_drive::RemoteDrive;
use nimbus_fuse::MountOptions;
use nimbus_graph::{FileTokenProvider, GraphClient};
use nimbus_realtime::{RealtimeMode, RealtimeTransport, TransportConfig};
use nimbus_sync::{StoreSessionPersistence, SyncEngine};

/// Azure application id used for token refresh when none is given.
const DEFAULT_CLIENT_ID: &str = "3861a1cb-0a46-4fd9-9e49-fb3c0ec2772d";

#[derive(Parser)]
#[command(name = "nimbusfs", version, about = "Mount a OneDrive drive as a filesystem")]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. "info" or "nimbus=debug".
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the drive at the given path and serve until SIGINT/SIGTERM.
    Mount(MountArgs),
    /// Print the effective configuration as YAML and exit.
    Config(ConfigArgs),
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// Configuration file (defaults to the XDG location).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(clap::Args)]
struct MountArgs {
    /// Mount point (an existing writable directory).
    path: PathBuf,

    /// Configuration file (defaults to the XDG location).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Account email; locates the auth token file.
    #[arg(long, env = "NIMBUSFS_ACCOUNT")]
    account: String,

    /// OAuth client id for token refresh.
    #[arg(long, env = "NIMBUSFS_CLIENT_ID")]
    client_id: Option<String>,

    /// Start in operational offline mode (no network at all).
    #[arg(long)]
    offline: bool,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,

    // --- Overrides for the recognized configuration keys ---
    /// Disable the realtime transport (realtime.enabled=false).
    #[arg(long)]
    no_realtime: bool,

    /// Force polling mode (realtime.pollingOnly=true).
    #[arg(long)]
    polling_only: bool,

    /// Polling interval in seconds when realtime is unavailable.
    #[arg(long)]
    fallback_interval: Option<u64>,

    /// Hydration worker count (hydration.workers).
    #[arg(long)]
    hydration_workers: Option<usize>,

    /// Hydration queue bound (hydration.queueSize).
    #[arg(long)]
    hydration_queue_size: Option<usize>,

    /// Metadata worker count (metadataQueue.workers).
    #[arg(long)]
    metadata_workers: Option<usize>,

    /// Mount startup timeout in seconds (mountTimeout).
    #[arg(long)]
    mount_timeout: Option<u64>,

    /// Conflict policy: last-writer-wins, keep-both, keep-local,
    /// keep-remote, or prompt.
    #[arg(long)]
    conflict_policy: Option<String>,
}

fn init_logging(filter: Option<&str>) {
    let env_filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>, args: Option<&MountArgs>) -> anyhow::Result<Config> {
    let path = path.cloned().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&path);

    if let Some(args) = args {
        if args.no_realtime {
            config.realtime.enabled = false;
        }
        if args.polling_only {
            config.realtime.polling_only = true;
        }
        if let Some(interval) = args.fallback_interval {
            config.realtime.fallback_interval_seconds = interval;
        }
        if let Some(workers) = args.hydration_workers {
            config.hydration.workers = workers;
        }
        if let Some(queue) = args.hydration_queue_size {
            config.hydration.queue_size = queue;
        }
        if let Some(workers) = args.metadata_workers {
            config.metadata_queue.workers = workers;
        }
        if let Some(timeout) = args.mount_timeout {
            config.mount_timeout = timeout;
        }
        if let Some(policy) = &args.conflict_policy {
            config.conflict_policy = parse_policy(policy)?;
        }
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("configuration error: {error}");
        }
        anyhow::bail!("{} configuration error(s)", errors.len());
    }
    Ok(config)
}

fn parse_policy(s: &str) -> anyhow::Result<ConflictPolicy> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .with_context(|| format!("unknown conflict policy '{s}'"))
}

async fn run_mount(args: MountArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_ref(), Some(&args))?;
    let context = NimbusContext::new(args.offline);

    let cache_dir = Config::mount_cache_dir(&args.path);
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("creating cache directory {}", cache_dir.display()))?;

    // The store pool is shared between the engine and the Graph
    // client's upload-session persistence.
    let pool = SyncEngine::open_pool(&cache_dir).await?;
    let store = Arc::new(nimbus_store::MetadataStore::new(&pool));

    let client_id = args
        .client_id
        .clone()
        .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());
    // Older releases kept the token file beside the mount cache.
    let legacy_tokens = cache_dir.join("auth_tokens.json");
    let tokens = Arc::new(FileTokenProvider::new(
        Arc::clone(&context),
        &args.account,
        client_id,
        legacy_tokens.exists().then_some(legacy_tokens),
    ));

    let drive: Arc<dyn RemoteDrive> = Arc::new(
        GraphClient::new(tokens, Arc::clone(&context))
            .with_session_persistence(StoreSessionPersistence::new(store)),
    );

    let realtime: Option<Arc<dyn RealtimeLink>> =
        match RealtimeMode::from_config(&config.realtime) {
            RealtimeMode::Realtime => {
                let transport: Arc<dyn RealtimeLink> =
                    RealtimeTransport::new(Arc::clone(&drive), TransportConfig::default());
                Some(transport)
            }
            RealtimeMode::PollingOnly | RealtimeMode::Disabled => None,
        };

    let engine = SyncEngine::start(config, context, drive, realtime, pool, &cache_dir).await?;

    let mut options = MountOptions::new(args.path.clone());
    options.allow_other = args.allow_other;
    nimbus_fuse::mount(engine, options).await?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");

    let result = match cli.command {
        Command::Mount(args) => runtime.block_on(run_mount(args)),
        Command::Config(args) => load_config(args.config.as_ref(), None).map(|config| {
            match serde_yaml::to_string(&config) {
                Ok(yaml) => print!("{yaml}"),
                Err(e) => eprintln!("failed to render configuration: {e}"),
            }
        }),
    };

    // Give background tasks a moment to finish their logs.
    runtime.shutdown_timeout(Duration::from_secs(2));

    if let Err(e) = result {
        eprintln!("nimbusfs: {e:#}");
        std::process::exit(1);
    }
}
