//! ExtractionDispatcher - pick a backend for a file and run it
//!
//! Selection maps a normalized content type to the most specific registered
//! pattern (exact > family > any), earliest registration winning ties.
//!
//! Execution follows the backend's [`ConcurrencyModel`]:
//!
//! | Model          | Where it runs                                        |
//! |----------------|------------------------------------------------------|
//! | `None`         | inline in the dispatch call                          |
//! | `MainThread`   | one lane shared by every main-thread backend         |
//! | `SingleWorker` | one lane per backend                                 |
//! | `WorkerPool`   | spawned tasks bounded by a semaphore of `pool_size`  |
//!
//! Every call runs under the per-item time budget and a per-path admission
//! lock, so two items for the same path never overlap inside a backend.

use std::{
  any::Any,
  collections::HashMap,
  panic::AssertUnwindSafe,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
  domain::{
    config::{BackendEntry, ConfigError, DispatchConfig},
    content::{self, MimePattern, PatternError},
  },
  extract::{self, CommandBackend, ConcurrencyModel, ExtractError, ExtractRequest, ExtractionBackend},
  store::Statement,
};

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
  #[error("Backend {backend}: {source}")]
  InvalidPattern {
    backend: String,
    #[source]
    source: PatternError,
  },

  #[error("Backend {backend} has no content types")]
  NoPatterns { backend: String },

  #[error("Backend {backend} failed to initialize: {source}")]
  Init {
    backend: String,
    #[source]
    source: ExtractError,
  },

  #[error("Unknown built-in backend: {0}")]
  UnknownBuiltin(String),
}

pub struct RegisteredBackend {
  pub name: String,
  pub patterns: Vec<MimePattern>,
  pub concurrency: ConcurrencyModel,
  pub backend: Arc<dyn ExtractionBackend>,
}

impl RegisteredBackend {
  pub fn matches(&self, content_type: &str) -> bool {
    self.patterns.iter().any(|p| p.matches(content_type))
  }

  fn specificity_for(&self, content_type: &str) -> Option<u8> {
    self
      .patterns
      .iter()
      .filter(|p| p.matches(content_type))
      .map(MimePattern::specificity)
      .max()
  }
}

/// Content-type → backend table, fixed after startup
#[derive(Default)]
pub struct BackendRegistry {
  entries: Vec<RegisteredBackend>,
}

impl BackendRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// The built-in text, image and directory backends
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    for (name, mime) in [
      ("text", "text/*"),
      ("image", "image/*"),
      ("directory", content::DIRECTORY_MIME),
    ] {
      if let Err(e) = registry.register_builtin(name, &[mime.to_string()], None) {
        warn!(backend = name, error = %e, "Skipping built-in backend");
      }
    }
    registry
  }

  /// Build from the `[[backends]]` table.
  ///
  /// Malformed patterns are fatal. Unknown built-ins and helpers that fail
  /// to initialize are skipped with a warning.
  pub fn from_table(table: &[BackendEntry]) -> Result<Self, ConfigError> {
    if table.is_empty() {
      return Ok(Self::with_defaults());
    }

    let mut registry = Self::new();
    for entry in table {
      let result = match (&entry.builtin, &entry.command) {
        (Some(builtin), None) => registry.register_builtin(builtin, &entry.mime, entry.concurrency),
        (None, Some(command)) => CommandBackend::new(&entry.name, command)
          .map_err(|source| DispatchError::Init {
            backend: entry.name.clone(),
            source,
          })
          .and_then(|backend| registry.register(&entry.name, &entry.mime, entry.concurrency, Arc::new(backend))),
        _ => Err(DispatchError::Init {
          backend: entry.name.clone(),
          source: ExtractError::Unavailable("set exactly one of `builtin` or `command`".to_string()),
        }),
      };

      match result {
        Ok(()) => {}
        Err(e @ (DispatchError::InvalidPattern { .. } | DispatchError::NoPatterns { .. })) => {
          return Err(ConfigError::InvalidBackend {
            name: entry.name.clone(),
            reason: e.to_string(),
          });
        }
        Err(e) => warn!(backend = %entry.name, error = %e, "Skipping backend"),
      }
    }

    Ok(registry)
  }

  fn register_builtin(
    &mut self,
    name: &str,
    patterns: &[String],
    concurrency: Option<ConcurrencyModel>,
  ) -> Result<(), DispatchError> {
    let backend = extract::builtin(name).ok_or_else(|| DispatchError::UnknownBuiltin(name.to_string()))?;
    self.register(name, patterns, concurrency, backend)
  }

  /// Register a backend under `patterns`. `concurrency` overrides the
  /// backend's own default.
  pub fn register(
    &mut self,
    name: &str,
    patterns: &[String],
    concurrency: Option<ConcurrencyModel>,
    backend: Arc<dyn ExtractionBackend>,
  ) -> Result<(), DispatchError> {
    if patterns.is_empty() {
      return Err(DispatchError::NoPatterns {
        backend: name.to_string(),
      });
    }
    let patterns = patterns
      .iter()
      .map(|p| MimePattern::parse(p))
      .collect::<Result<Vec<_>, _>>()
      .map_err(|source| DispatchError::InvalidPattern {
        backend: name.to_string(),
        source,
      })?;

    backend.init().map_err(|source| DispatchError::Init {
      backend: name.to_string(),
      source,
    })?;

    let concurrency = concurrency.unwrap_or_else(|| backend.default_concurrency());
    debug!(backend = name, %concurrency, patterns = patterns.len(), "Registered backend");
    self.entries.push(RegisteredBackend {
      name: name.to_string(),
      patterns,
      concurrency,
      backend,
    });
    Ok(())
  }

  /// Index of the most specific backend for a normalized content type
  fn select_index(&self, content_type: &str) -> Option<usize> {
    let mut best: Option<(usize, u8)> = None;
    for (index, entry) in self.entries.iter().enumerate() {
      if let Some(specificity) = entry.specificity_for(content_type)
        && best.is_none_or(|(_, current)| specificity > current)
      {
        best = Some((index, specificity));
      }
    }
    best.map(|(index, _)| index)
  }

  pub fn select(&self, content_type: &str) -> Option<&RegisteredBackend> {
    self.select_index(content_type).map(|index| &self.entries[index])
  }

  pub fn names(&self) -> Vec<String> {
    self.entries.iter().map(|e| e.name.clone()).collect()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  fn shutdown(&self) {
    for entry in &self.entries {
      entry.backend.shutdown();
    }
  }
}

// ============================================================================
// Lanes
// ============================================================================

type LaneJob = BoxFuture<'static, ()>;

/// A long-lived task that runs its jobs one at a time, in arrival order
struct Lane {
  tx: mpsc::UnboundedSender<LaneJob>,
}

impl Lane {
  fn spawn(name: String, cancel: CancellationToken) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel::<LaneJob>();
    tokio::spawn(async move {
      trace!(lane = %name, "Lane started");
      loop {
        tokio::select! {
          biased;

          _ = cancel.cancelled() => break,

          job = rx.recv() => match job {
            Some(job) => job.await,
            None => break,
          },
        }
      }
      trace!(lane = %name, "Lane stopped");
    });
    Self { tx }
  }

  async fn run(
    &self,
    backend: Arc<dyn ExtractionBackend>,
    request: ExtractRequest,
    budget: Duration,
  ) -> Result<Vec<Statement>, ExtractError> {
    let (tx, rx) = oneshot::channel();
    let job = async move {
      let _ = tx.send(guarded(backend, request, budget).await);
    }
    .boxed();

    self
      .tx
      .send(job)
      .map_err(|_| ExtractError::Unavailable("worker lane stopped".to_string()))?;
    rx.await.unwrap_or(Err(ExtractError::Cancelled))
  }
}

/// Run one extraction under the time budget and the request's cancel token
async fn guarded(
  backend: Arc<dyn ExtractionBackend>,
  request: ExtractRequest,
  budget: Duration,
) -> Result<Vec<Statement>, ExtractError> {
  let cancel = request.cancel.clone();
  let result = tokio::select! {
    biased;

    _ = cancel.cancelled() => Err(ExtractError::Cancelled),

    result = tokio::time::timeout(budget, contained(backend, request)) => {
      result.unwrap_or(Err(ExtractError::Timeout(budget)))
    }
  };

  // Let helpers the backend spawned see the cancellation
  if matches!(result, Err(ExtractError::Timeout(_))) {
    cancel.cancel();
  }
  result
}

/// A panicking backend fails its item instead of unwinding through a lane or
/// the caller's task.
async fn contained(
  backend: Arc<dyn ExtractionBackend>,
  request: ExtractRequest,
) -> Result<Vec<Statement>, ExtractError> {
  let path = request.path.clone();
  AssertUnwindSafe(async move { backend.extract(request).await })
    .catch_unwind()
    .await
    .unwrap_or_else(|payload| {
      let message = panic_message(payload.as_ref());
      warn!(path = %path.display(), panic = %message, "Backend panicked");
      Err(ExtractError::Failed(format!("backend panicked: {message}")))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// What happened to one dispatched file
#[derive(Debug)]
pub enum DispatchOutcome {
  Extracted { backend: String, facts: Vec<Statement> },
  NoBackend { content_type: String },
  Failed { backend: String, error: ExtractError },
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
  pub pool_size: usize,
  pub timeout: Duration,
}

impl From<&DispatchConfig> for DispatcherConfig {
  fn from(config: &DispatchConfig) -> Self {
    Self {
      pool_size: config.effective_pool_size(),
      timeout: config.timeout(),
    }
  }
}

pub struct ExtractionDispatcher {
  registry: BackendRegistry,
  main_lane: Lane,
  /// Keyed by registry index
  worker_lanes: HashMap<usize, Lane>,
  pool: Arc<Semaphore>,
  admission: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
  timeout: Duration,
  cancel: CancellationToken,
}

impl ExtractionDispatcher {
  /// Must be called inside a tokio runtime: lanes are spawned immediately.
  pub fn new(registry: BackendRegistry, config: DispatcherConfig, cancel: CancellationToken) -> Self {
    let main_lane = Lane::spawn("main".to_string(), cancel.clone());
    let worker_lanes = registry
      .entries
      .iter()
      .enumerate()
      .filter(|(_, entry)| entry.concurrency == ConcurrencyModel::SingleWorker)
      .map(|(index, entry)| (index, Lane::spawn(entry.name.clone(), cancel.clone())))
      .collect();

    let pool_size = config.pool_size.max(1);
    info!(
      backends = registry.len(),
      pool_size,
      timeout_secs = config.timeout.as_secs(),
      "Extraction dispatcher ready"
    );

    Self {
      registry,
      main_lane,
      worker_lanes,
      pool: Arc::new(Semaphore::new(pool_size)),
      admission: DashMap::new(),
      timeout: config.timeout,
      cancel,
    }
  }

  pub fn registry(&self) -> &BackendRegistry {
    &self.registry
  }

  /// Select a backend for `content_type` and run it on `path`.
  pub async fn dispatch(&self, path: &Path, content_type: &str) -> DispatchOutcome {
    let content_type = content::normalize(content_type);
    let Some(index) = self.registry.select_index(&content_type) else {
      trace!(path = %path.display(), %content_type, "No backend");
      return DispatchOutcome::NoBackend { content_type };
    };
    let entry = &self.registry.entries[index];

    let lock = Arc::clone(self.admission.entry(path.to_path_buf()).or_default().value());
    let guard = lock.lock().await;

    let request = ExtractRequest {
      path: path.to_path_buf(),
      content_type,
      cancel: self.cancel.child_token(),
    };
    trace!(path = %path.display(), backend = %entry.name, model = %entry.concurrency, "Dispatching");
    let result = self.execute(index, entry, request).await;

    drop(guard);
    drop(lock);
    self.admission.remove_if(path, |_, lock| Arc::strong_count(lock) == 1);

    match result {
      Ok(facts) => DispatchOutcome::Extracted {
        backend: entry.name.clone(),
        facts,
      },
      Err(error) => DispatchOutcome::Failed {
        backend: entry.name.clone(),
        error,
      },
    }
  }

  async fn execute(
    &self,
    index: usize,
    entry: &RegisteredBackend,
    request: ExtractRequest,
  ) -> Result<Vec<Statement>, ExtractError> {
    let backend = Arc::clone(&entry.backend);
    match entry.concurrency {
      ConcurrencyModel::None => guarded(backend, request, self.timeout).await,
      ConcurrencyModel::MainThread => self.main_lane.run(backend, request, self.timeout).await,
      ConcurrencyModel::SingleWorker => match self.worker_lanes.get(&index) {
        Some(lane) => lane.run(backend, request, self.timeout).await,
        None => Err(ExtractError::Unavailable(format!("no worker lane for {}", entry.name))),
      },
      ConcurrencyModel::WorkerPool => {
        let permit = Arc::clone(&self.pool)
          .acquire_owned()
          .await
          .map_err(|_| ExtractError::Unavailable("worker pool closed".to_string()))?;

        let budget = self.timeout;
        let handle = tokio::spawn(async move {
          let result = guarded(backend, request, budget).await;
          drop(permit);
          result
        });
        handle
          .await
          .unwrap_or_else(|e| Err(ExtractError::Failed(format!("Worker task failed: {e}"))))
      }
    }
  }

  /// Stop the lanes and let every backend release its resources
  pub fn shutdown(&self) {
    self.cancel.cancel();
    self.pool.close();
    self.registry.shutdown();
    debug!("Extraction dispatcher shut down");
  }
}
