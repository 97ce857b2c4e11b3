//! CLI command implementations

mod daemon;
mod index;
mod roots;
mod system;

use std::path::PathBuf;

use anyhow::{Context, Result};
use trawl::{Daemon, config::Config, dirs, ipc::Client};

pub use daemon::cmd_daemon;
pub use index::{cmd_index, cmd_reindex};
pub use roots::{cmd_roots_add, cmd_roots_list, cmd_roots_remove};
pub use system::{cmd_pause, cmd_resume, cmd_status, cmd_stop, cmd_throttle};

/// Socket from `daemon.socket_path`, or the default location
async fn socket_path() -> PathBuf {
  Config::load()
    .await
    .ok()
    .and_then(|config| config.daemon.socket_path)
    .unwrap_or_else(dirs::default_socket_path)
}

async fn connect() -> Result<Client> {
  Daemon::connect_or_start(socket_path().await)
    .await
    .context("Failed to connect to daemon")
}

/// Resolve a CLI path argument against the working directory
fn absolute(path: &str) -> Result<PathBuf> {
  let path = PathBuf::from(path);
  if path.is_absolute() {
    return Ok(path);
  }
  let cwd = std::env::current_dir().context("Failed to read current directory")?;
  Ok(cwd.join(path))
}
