//! Extraction backends
//!
//! A backend turns one file into a list of [`Statement`]s. Backends are
//! registered once at startup from the `[[backends]]` table and never change
//! afterwards. How a backend is scheduled is decided by its
//! [`ConcurrencyModel`], which the dispatcher honors.

pub mod builtin;
pub mod command;

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::store::Statement;

pub use builtin::{DirectoryBackend, ImageBackend, TextBackend};
pub use command::CommandBackend;

/// Execution discipline a backend requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyModel {
  /// Inline with the dispatch call
  None,
  /// Serialized with every other main-thread backend on one shared lane
  MainThread,
  /// One dedicated lane per backend
  SingleWorker,
  /// Bounded pool shared by all pool backends
  #[default]
  WorkerPool,
}

impl std::fmt::Display for ConcurrencyModel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::None => "none",
      Self::MainThread => "main_thread",
      Self::SingleWorker => "single_worker",
      Self::WorkerPool => "worker_pool",
    };
    write!(f, "{s}")
  }
}

#[derive(Debug, Clone)]
pub struct ExtractRequest {
  pub path: PathBuf,
  /// Normalized content type the backend was selected for
  pub content_type: String,
  /// Cancelled when the item times out or the daemon shuts down
  pub cancel: CancellationToken,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractError {
  #[error("Failed to read {path}: {message}")]
  Io { path: PathBuf, message: String },

  #[error("Unsupported content: {0}")]
  Unsupported(String),

  #[error("Extraction failed: {0}")]
  Failed(String),

  #[error("Extraction timed out after {0:?}")]
  Timeout(Duration),

  #[error("Extraction cancelled")]
  Cancelled,

  #[error("Backend unavailable: {0}")]
  Unavailable(String),
}

impl ExtractError {
  pub(crate) fn io(path: &std::path::Path, err: std::io::Error) -> Self {
    Self::Io {
      path: path.to_path_buf(),
      message: err.to_string(),
    }
  }
}

#[async_trait]
pub trait ExtractionBackend: Send + Sync {
  fn name(&self) -> &str;

  /// Used when the backend table does not say otherwise
  fn default_concurrency(&self) -> ConcurrencyModel {
    ConcurrencyModel::WorkerPool
  }

  /// Called once at registration. An error keeps the backend out of the registry.
  fn init(&self) -> Result<(), ExtractError> {
    Ok(())
  }

  fn shutdown(&self) {}

  async fn extract(&self, request: ExtractRequest) -> Result<Vec<Statement>, ExtractError>;
}

/// Look up a built-in backend by its configured name
pub fn builtin(name: &str) -> Option<Arc<dyn ExtractionBackend>> {
  match name {
    "text" => Some(Arc::new(TextBackend)),
    "image" => Some(Arc::new(ImageBackend)),
    "directory" => Some(Arc::new(DirectoryBackend)),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_concurrency_model_serde() {
    #[derive(Deserialize)]
    struct Entry {
      concurrency: ConcurrencyModel,
    }

    let entry: Entry = toml::from_str(r#"concurrency = "single_worker""#).unwrap();
    assert_eq!(entry.concurrency, ConcurrencyModel::SingleWorker);
    assert_eq!(ConcurrencyModel::default(), ConcurrencyModel::WorkerPool);
    assert_eq!(ConcurrencyModel::MainThread.to_string(), "main_thread");
  }

  #[test]
  fn test_builtin_lookup() {
    assert_eq!(builtin("text").map(|b| b.name().to_string()).as_deref(), Some("text"));
    assert_eq!(
      builtin("directory").map(|b| b.default_concurrency()),
      Some(ConcurrencyModel::None)
    );
    assert!(builtin("ocr").is_none());
  }
}
