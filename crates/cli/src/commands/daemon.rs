//! Daemon command

use anyhow::{Context, Result};
use trawl::{Daemon, RuntimeConfig};

use crate::logging::init_daemon_logging;

/// Run the daemon in this process
pub async fn cmd_daemon(foreground: bool) -> Result<()> {
  let runtime = RuntimeConfig::load().await.context("Failed to load config")?;
  let runtime = RuntimeConfig { foreground, ..runtime };
  let _guard = init_daemon_logging(&runtime);

  if foreground {
    Daemon::spawn_foreground(runtime).await
  } else {
    Daemon::run_background(runtime).await
  }
  .context("Failed to run daemon")
}
