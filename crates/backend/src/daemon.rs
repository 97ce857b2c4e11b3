//! Daemon lifecycle
//!
//! # Architecture
//!
//! ```text
//! Daemon (Supervisor)
//!   ├── Server (IPC listener, spawns connection tasks)
//!   │     └── Control
//!   └── Pipeline
//!         ├── CrawlScheduler + WatcherTask
//!         ├── ExtractionDispatcher
//!         └── RequestTracker
//! ```
//!
//! # Lifecycle
//!
//! 1. Create master `CancellationToken`
//! 2. Build the `Pipeline` from config (a bad backend table is fatal)
//! 3. Start the pipeline with the configured roots
//! 4. Run the server until ctrl-c or a `shutdown` request
//! 5. Shut the pipeline down and wait for the drain loop

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  actor::{Pipeline, PipelineError},
  control::Control,
  dirs,
  domain::config::{Config, ConfigError},
  ipc::{Client, IpcError},
  server::{Server, ServerConfig},
  store::MemoryStore,
};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
  #[error("Pipeline error: {0}")]
  Pipeline(#[from] PipelineError),
  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),
}

// ============================================================================
// Configuration
// ============================================================================

/// Everything the daemon needs to run, resolved from the config file.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  /// Path to the Unix socket for IPC
  pub socket_path: PathBuf,
  /// Base directory for daemon data (logs)
  pub data_dir: PathBuf,
  /// Log to the console instead of files
  pub foreground: bool,
  pub config: Config,
}

impl RuntimeConfig {
  pub async fn load() -> Result<Self, ConfigError> {
    // Auto-create user config on first run if it doesn't exist
    Self::ensure_user_config().await;

    let config = Config::load().await?;

    Ok(Self {
      socket_path: config.daemon.socket_path.clone().unwrap_or_else(dirs::default_socket_path),
      data_dir: dirs::default_data_dir(),
      foreground: false,
      config,
    })
  }

  /// Ensure user config file exists, creating it with defaults if not.
  async fn ensure_user_config() {
    let Some(user_config_path) = Config::user_config_path() else {
      return;
    };

    if user_config_path.exists() {
      return;
    }

    if let Some(parent) = user_config_path.parent()
      && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
      warn!(error = %e, "Failed to create config directory");
      return;
    }

    match tokio::fs::write(&user_config_path, Config::generate_template()).await {
      Ok(()) => info!(path = %user_config_path.display(), "Created user config"),
      Err(e) => warn!(error = %e, "Failed to create user config"),
    }
  }
}

// ============================================================================
// Daemon
// ============================================================================

pub struct Daemon {
  runtime_config: RuntimeConfig,
}

impl Daemon {
  pub fn new(runtime_config: RuntimeConfig) -> Self {
    Self { runtime_config }
  }

  /// Connect to the daemon on `socket_path`, starting one if necessary.
  ///
  /// Polls for up to 5 seconds after spawning.
  pub async fn connect_or_start(socket_path: PathBuf) -> Result<Client, IpcError> {
    if dirs::is_daemon_running(&socket_path) {
      debug!("Daemon is already running, connecting...");
      return Client::connect_to(&socket_path).await;
    }

    info!("Daemon is not running, starting in background...");
    let pid = Self::spawn_detached()?;
    debug!(pid, "Spawned daemon");

    let delay = Duration::from_millis(500);
    let max_attempts = 10;
    for attempt in 1..=max_attempts {
      tokio::time::sleep(delay).await;
      if let Ok(client) = Client::connect_to(&socket_path).await {
        info!("Connected to daemon");
        return Ok(client);
      }
      debug!(attempt, max_attempts, "Waiting for daemon to start...");
    }

    Err(IpcError::Connection("Failed to connect to daemon after startup".into()))
  }

  /// Re-execute the current binary as `daemon --background`, detached.
  ///
  /// A fresh process gets its own Tokio runtime, which wouldn't survive a fork.
  fn spawn_detached() -> std::io::Result<u32> {
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe()?;
    let child = Command::new(&exe)
      .arg("daemon")
      .arg("--background")
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn()?;

    Ok(child.id())
  }

  /// Run in the current process, blocking until shutdown.
  pub async fn spawn_foreground(config: RuntimeConfig) -> Result<(), DaemonError> {
    Self::new(RuntimeConfig {
      foreground: true,
      ..config
    })
    .run()
    .await
  }

  /// Entry point for a process started by [`Daemon::connect_or_start`].
  pub async fn run_background(config: RuntimeConfig) -> Result<(), DaemonError> {
    Self::new(RuntimeConfig {
      foreground: false,
      ..config
    })
    .run()
    .await
  }

  pub async fn run(self) -> Result<(), DaemonError> {
    let RuntimeConfig {
      socket_path,
      data_dir,
      foreground,
      config,
    } = self.runtime_config;

    info!(
      socket = %socket_path.display(),
      data_dir = %data_dir.display(),
      foreground,
      "Starting trawl daemon"
    );

    // Master cancellation token - propagates to all children
    let cancel = CancellationToken::new();

    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::from_config(&config, store, cancel.child_token())?;
    let drain = pipeline.start(&config.index.roots).await?;

    let control = Arc::new(Control::new(Arc::clone(&pipeline), cancel.clone()));
    let server = Server::new(ServerConfig {
      socket_path,
      control,
    });

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
      if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        return;
      }
      info!("Received ctrl-c, shutting down...");
      cancel_for_signal.cancel();
    });

    let served = server.run(cancel.child_token()).await;

    info!("Shutting down pipeline...");
    pipeline.shutdown();
    cancel.cancel();
    if let Err(e) = drain.await {
      warn!(error = %e, "Drain loop ended abnormally");
    }

    let stats = pipeline.stats();
    info!(
      indexed = stats.indexed,
      deleted = stats.deleted,
      failed = stats.failed,
      "Daemon stopped"
    );
    served.map_err(DaemonError::from)
  }
}
