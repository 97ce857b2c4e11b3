//! Configuration for the trawl daemon
//!
//! Config lives at `$CONFIG_DIR/config.toml`, `$XDG_CONFIG_HOME/trawl/config.toml`
//! or the platform config dir. Every section is `#[serde(default)]` so a
//! partial file only overrides what it names.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::extract::ConcurrencyModel;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to parse config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("Invalid root {path}: {reason}")]
  InvalidRoot { path: PathBuf, reason: String },

  #[error("Invalid backend entry {name:?}: {reason}")]
  InvalidBackend { name: String, reason: String },

  #[error("Invalid value for {field}: {reason}")]
  InvalidValue { field: &'static str, reason: String },
}

// ============================================================================
// Index Configuration
// ============================================================================

/// A root registered at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootConfig {
  pub path: PathBuf,

  #[serde(default = "default_true")]
  pub recurse: bool,

  /// Globs matched against each path component below the root
  #[serde(default)]
  pub exclude_globs: Vec<String>,

  /// Content-type patterns (`image/*`) that are never indexed under this root
  #[serde(default)]
  pub exclude_mime: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
  pub roots: Vec<RootConfig>,

  /// Skip dot-files and dot-directories
  pub ignore_hidden: bool,

  /// Throttle factor applied at startup (0.0 - 1.0)
  pub initial_throttle: f64,

  /// Delay between dequeues when the throttle factor is 1.0
  pub max_throttle_delay_ms: u64,

  /// Watch roots for filesystem changes
  pub watch: bool,
}

impl Default for IndexConfig {
  fn default() -> Self {
    Self {
      roots: Vec::new(),
      ignore_hidden: true,
      initial_throttle: 0.0,
      max_throttle_delay_ms: 1000,
      watch: true,
    }
  }
}

impl IndexConfig {
  pub fn max_throttle_delay(&self) -> Duration {
    Duration::from_millis(self.max_throttle_delay_ms)
  }
}

// ============================================================================
// Dispatch Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
  /// Worker pool size for `worker_pool` backends (0 = number of CPUs)
  pub pool_size: usize,

  /// Maximum dispatch tasks in flight at once (0 = 2x pool size)
  pub max_in_flight: usize,

  /// Per-item time budget for a backend call
  pub timeout_secs: u64,
}

impl Default for DispatchConfig {
  fn default() -> Self {
    Self {
      pool_size: 0,
      max_in_flight: 0,
      timeout_secs: 30,
    }
  }
}

impl DispatchConfig {
  pub fn effective_pool_size(&self) -> usize {
    match self.pool_size {
      0 => num_cpus::get().max(1),
      n => n,
    }
  }

  pub fn effective_max_in_flight(&self) -> usize {
    match self.max_in_flight {
      0 => self.effective_pool_size() * 2,
      n => n,
    }
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

// ============================================================================
// Backend Table
// ============================================================================

/// One row of the backend registration table
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEntry {
  pub name: String,

  /// Content-type patterns this backend handles
  pub mime: Vec<String>,

  /// Defaults to the built-in's own model, or `single_worker` for commands
  pub concurrency: Option<ConcurrencyModel>,

  /// Name of a built-in backend (`text`, `image`, `directory`)
  pub builtin: Option<String>,

  /// External helper: program followed by its arguments. The file path replaces
  /// a `{path}` argument, or is appended when there is none.
  pub command: Option<Vec<String>>,
}

// ============================================================================
// Tracker Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
  /// Resolve the PID and binary name behind each caller
  pub client_lookup: bool,

  /// How long an idle client record survives
  pub cleanup_delay_secs: u64,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      client_lookup: true,
      cleanup_delay_secs: 300,
    }
  }
}

impl TrackerConfig {
  pub fn cleanup_delay(&self) -> Duration {
    Duration::from_secs(self.cleanup_delay_secs)
  }
}

// ============================================================================
// Daemon Configuration
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// Default: "info"
  pub log_level: String,

  /// Log file rotation: "daily", "hourly", "never"
  /// Default: "daily"
  pub log_rotation: String,

  /// Override the socket location
  pub socket_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      log_level: "info".to_string(),
      log_rotation: "daily".to_string(),
      socket_path: None,
    }
  }
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub index: IndexConfig,
  pub dispatch: DispatchConfig,
  pub tracker: TrackerConfig,
  pub daemon: DaemonConfig,

  /// Empty means the built-in defaults
  pub backends: Vec<BackendEntry>,
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("trawl").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("trawl").join("config.toml"))
  }

  /// Load the user config. A missing file yields defaults; a broken one is an error.
  pub async fn load() -> Result<Self, ConfigError> {
    match Self::user_config_path() {
      Some(path) if path.exists() => Self::load_from(&path).await,
      _ => Ok(Self::default()),
    }
  }

  pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;

    let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;

    config.validate()?;
    Ok(config)
  }

  /// Checks that can be made without touching the filesystem
  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&self.index.initial_throttle) {
      return Err(ConfigError::InvalidValue {
        field: "index.initial_throttle",
        reason: format!("{} is outside 0.0..=1.0", self.index.initial_throttle),
      });
    }

    for root in &self.index.roots {
      if !root.path.is_absolute() {
        return Err(ConfigError::InvalidRoot {
          path: root.path.clone(),
          reason: "must be absolute".to_string(),
        });
      }
    }

    for entry in &self.backends {
      match (&entry.builtin, &entry.command) {
        (Some(_), Some(_)) => {
          return Err(ConfigError::InvalidBackend {
            name: entry.name.clone(),
            reason: "set either `builtin` or `command`, not both".to_string(),
          });
        }
        (None, None) => {
          return Err(ConfigError::InvalidBackend {
            name: entry.name.clone(),
            reason: "one of `builtin` or `command` is required".to_string(),
          });
        }
        _ => {}
      }
      if entry.mime.is_empty() {
        return Err(ConfigError::InvalidBackend {
          name: entry.name.clone(),
          reason: "`mime` must list at least one pattern".to_string(),
        });
      }
    }

    Ok(())
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    r#"# trawl configuration
# Place in ~/.config/trawl/config.toml

# ============================================================================
# Indexing
# ============================================================================

[index]
# Skip dot-files and dot-directories
ignore_hidden = true

# Throttle factor at startup: 0.0 = full speed, 1.0 = slowest
initial_throttle = 0.0

# Delay between work items at throttle 1.0
max_throttle_delay_ms = 1000

# Watch roots for changes
watch = true

# Roots indexed at startup (more can be added with `trawl roots add`):
# [[index.roots]]
# path = "/home/me/Documents"
# recurse = true
# exclude_globs = ["*.tmp", "node_modules"]
# exclude_mime = ["video/*"]

# ============================================================================
# Dispatch
# ============================================================================

[dispatch]
# Worker pool size (0 = number of CPUs)
pool_size = 0

# Maximum items being processed at once (0 = 2x pool size)
max_in_flight = 0

# Per-file time budget for a backend
timeout_secs = 30

# ============================================================================
# Request tracking
# ============================================================================

[tracker]
# Resolve PID and binary name of callers
client_lookup = true

# Seconds an idle caller is remembered
cleanup_delay_secs = 300

# ============================================================================
# Daemon
# ============================================================================

[daemon]
# Log level: off, error, warn, info, debug, trace
log_level = "info"

# Log rotation: daily, hourly, never
log_rotation = "daily"

# ============================================================================
# Backends (omit to use the built-in text, image and directory backends)
# ============================================================================

# [[backends]]
# name = "text"
# mime = ["text/*"]
# builtin = "text"
# concurrency = "worker_pool"
#
# [[backends]]
# name = "pdf"
# mime = ["application/pdf"]
# command = ["pdftotext", "-q", "{path}", "-"]
# concurrency = "single_worker"
"#
    .to_string()
  }
}
