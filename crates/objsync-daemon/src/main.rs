//! objsync Daemon - keeps a local directory and a bucket in sync
//!
//! This binary runs in the foreground (or as a user service) and handles:
//! - Uploading local changes reported by the file watcher
//! - Downloading remote changes reported by the bucket poller
//! - A full reconciliation once the initial directory scan completes
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! ```text
//! FileWatcher ──→ WatchPump ──→ SyncManager ←── RemotePoller ←── bucket
//!      ↑                            │
//!  PauseGate ←──── pause/resume ────┘
//! ```
//!
//! Every long-running task observes one `CancellationToken`, triggered on
//! receipt of SIGTERM or SIGINT.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use objsync_core::config::{expand_tilde, Config};
use objsync_core::domain::IgnoreRules;
use objsync_core::ports::{IObjectEventListener, IObjectStore};
use objsync_s3::{RemotePoller, S3ObjectStore};
use objsync_sync::pause::PauseGate;
use objsync_sync::pump::WatchPump;
use objsync_sync::watcher::FileWatcher;
use objsync_sync::SyncManager;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for queued transfers to finish
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Command line
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "objsyncd",
    version,
    about = "Synchronize a local directory with an S3 / MinIO bucket"
)]
struct Cli {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the sync root directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Skip the reconciliation pass after the initial scan
    #[arg(long)]
    no_initial_sync: bool,
}

/// Log filter for the given verbosity, falling back to the configured level
fn log_filter(verbose: u8, configured: &str) -> String {
    match verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Load the configuration, apply command line overrides and validate it
///
/// An explicitly given config file must exist and parse; the default
/// location falls back to built-in defaults.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()),
    };

    if let Some(root) = &cli.root {
        config.sync.root = root.clone();
    }
    if cli.no_initial_sync {
        config.sync.initial_sync = false;
    }

    let errors = config.validate();
    if !errors.is_empty() {
        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
        bail!("Invalid configuration:\n  {}", details.join("\n  "));
    }
    Ok(config)
}

// ============================================================================
// DaemonService
// ============================================================================

/// Wires the object store, sync manager, watcher and poller together
struct DaemonService {
    config: Config,
    /// Token for signalling graceful shutdown to all async tasks
    shutdown: CancellationToken,
}

impl DaemonService {
    fn new(config: Config, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    /// Runs until the shutdown token is cancelled
    ///
    /// 1. Prepares the sync root and connects to the bucket
    /// 2. Builds the sync manager and wires listener and pause gate
    /// 3. Starts the watcher, the pump and (optionally) the remote poller
    /// 4. On shutdown, stops the sources and drains queued transfers
    async fn run(&self) -> Result<()> {
        let root = expand_tilde(&self.config.sync.root);
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create sync root {}", root.display()))?;
        info!(root = %root.display(), "Sync root ready");

        let store = Arc::new(
            S3ObjectStore::connect(&self.config.s3)
                .await
                .context("Failed to configure object store client")?,
        );
        store
            .init()
            .await
            .with_context(|| format!("Failed to initialize bucket {}", store.bucket()))?;

        let manager = Arc::new(SyncManager::from_config(
            root.clone(),
            &self.config,
            store.clone(),
        ));
        let listener: Arc<dyn IObjectEventListener> = manager.clone();
        store.set_event_listener(Arc::downgrade(&listener));

        let gate = PauseGate::new();
        manager.set_watch_control(Arc::new(gate.clone()));
        manager.on_sync_end(|| info!("Reconciliation pass ended"));

        let ignore = IgnoreRules::new(self.config.sync.ignore.iter().cloned());
        let (mut watcher, change_rx) = FileWatcher::new(root, ignore, Some(gate))?;
        let _watch = watcher.watch()?;

        let pump = WatchPump::new(
            change_rx,
            manager.clone(),
            Duration::from_millis(self.config.watcher.stability_ms),
            Duration::from_millis(self.config.watcher.poll_interval_ms),
            self.shutdown.clone(),
        )
        .sync_on_ready(self.config.sync.initial_sync);
        let pump_task = tokio::spawn(pump.run());

        let poller_task = if self.config.s3.listen_updates && self.config.permissions.read {
            let poller = RemotePoller::new(
                store.clone(),
                Duration::from_secs(self.config.s3.poll_interval_secs),
                self.shutdown.clone(),
            );
            Some(tokio::spawn(poller.run()))
        } else {
            info!("Remote change polling disabled");
            None
        };

        info!("objsync daemon running");
        self.shutdown.cancelled().await;
        info!("Shutdown signal received, stopping sources");

        if let Err(e) = watcher.unwatch() {
            warn!(error = %e, "Failed to stop file watcher");
        }
        if let Err(e) = pump_task.await {
            error!(error = %e, "Watch pump task failed");
        }
        if let Some(task) = poller_task {
            if let Err(e) = task.await {
                error!(error = %e, "Remote poller task failed");
            }
        }

        info!("Waiting for queued transfers");
        if tokio::time::timeout(DRAIN_TIMEOUT, manager.queueing().wait_idle())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "Queued transfers still running at shutdown"
            );
        }

        Ok(())
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let filter = log_filter(cli.verbose, &config.logging.level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    info!("objsync daemon starting (objsyncd)");

    let shutdown_token = CancellationToken::new();

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, shutdown_token);
    let result = service.run().await;

    match &result {
        Ok(()) => info!("objsync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "objsync daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("objsyncd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_flags() {
        let cli = parse(&["-vv", "--root", "/tmp/mirror", "--no-initial-sync"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/mirror")));
        assert!(cli.no_initial_sync);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_log_filter() {
        assert_eq!(log_filter(0, "warn"), "warn");
        assert_eq!(log_filter(1, "warn"), "debug");
        assert_eq!(log_filter(3, "warn"), "trace");
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "sync:\n  root: /srv/data\ns3:\n  bucket: photos\n  access_key: AK\n  secret_key: SK\n",
        )
        .unwrap();

        let config_arg = path.to_string_lossy().to_string();
        let cli = parse(&["--config", &config_arg, "--root", "/srv/other", "--no-initial-sync"]);
        let config = load_config(&cli).unwrap();

        assert_eq!(config.sync.root, PathBuf::from("/srv/other"));
        assert!(!config.sync.initial_sync);
        assert_eq!(config.s3.bucket, "photos");
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "s3:\n  bucket: \"\"\n").unwrap();

        let config_arg = path.to_string_lossy().to_string();
        let err = load_config(&parse(&["--config", &config_arg])).unwrap_err();
        assert!(err.to_string().contains("Invalid configuration"));
    }

    #[test]
    fn test_load_config_missing_explicit_file_fails() {
        let err = load_config(&parse(&["--config", "/nonexistent/objsync.yaml"])).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }

    #[tokio::test]
    async fn test_run_creates_root_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("mirror");

        let mut config = Config::default();
        config.sync.root = root.clone();
        config.s3.endpoint = "ftp://files.example.com".to_string();

        let service = DaemonService::new(config, CancellationToken::new());
        let err = service.run().await.unwrap_err();

        assert!(err.to_string().contains("Failed to configure object store client"));
        assert!(root.is_dir());
    }
}
