//! Handles for talking to long-lived tasks
//!
//! Handles are cheap to clone and wrap the channel sender of the task they
//! address.

use std::path::PathBuf;

use tokio::sync::mpsc;

use super::message::WatchCommand;

// ============================================================================
// Watcher Handle
// ============================================================================

/// Handle to add and remove roots on the running watcher
#[derive(Clone, Debug)]
pub struct WatcherHandle {
  tx: mpsc::Sender<WatchCommand>,
}

impl WatcherHandle {
  pub fn new(tx: mpsc::Sender<WatchCommand>) -> Self {
    Self { tx }
  }

  pub async fn send(&self, command: WatchCommand) -> Result<(), SendError> {
    self.tx.send(command).await.map_err(|_| SendError::ActorGone)
  }

  pub async fn watch(&self, root: PathBuf, recursive: bool) -> Result<(), SendError> {
    self.send(WatchCommand::Watch { root, recursive }).await
  }

  pub async fn unwatch(&self, root: PathBuf) -> Result<(), SendError> {
    self.send(WatchCommand::Unwatch { root }).await
  }
}

// ============================================================================
// Errors
// ============================================================================

/// Error when sending to a task
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
  #[error("Actor has shut down")]
  ActorGone,
}
