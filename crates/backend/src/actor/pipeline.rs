//! Pipeline - composition root for scheduler, dispatcher, store and watcher
//!
//! ```text
//! WatcherTask ──▶ CrawlScheduler ──next_item──▶ drain loop ──▶ ExtractionDispatcher
//!                      ▲                            │
//!                      │ control ops                ▼
//!                   Pipeline ◀── IPC        Store (submit facts / delete / move)
//! ```
//!
//! The drain loop pulls one item at a time from the scheduler, bounded by
//! `max_in_flight` spawned tasks, and reports each item back with
//! `complete` once its outcome has been applied to the store.

use std::{
  path::{Path, PathBuf},
  sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::Instant,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
  dispatcher::{BackendRegistry, DispatchOutcome, DispatcherConfig, ExtractionDispatcher},
  handle::WatcherHandle,
  lifecycle::{IdentityResolver, ProcIdentityResolver, RequestTracker, TrackerConfig},
  message::{WorkItem, WorkKind, WritebackData, priority},
  scheduler::{CrawlScheduler, RootSummary, SchedulerConfig, SchedulerError, SchedulerState},
  watcher::{WatcherError, WatcherTask},
};
use crate::{
  domain::{
    config::{Config, ConfigError, RootConfig},
    content::{self, MimePattern},
    tree::{IndexingTree, RootFilter, SharedTree, TreeError},
  },
  store::{Query, Statement, Store, StoreError, predicate},
};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
  #[error(transparent)]
  Scheduler(#[from] SchedulerError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Watcher(#[from] WatcherError),

  #[error("Invalid file URI or path: {0}")]
  InvalidUri(String),

  #[error("Invalid content type pattern: {0}")]
  InvalidPattern(String),

  #[error("Failed to write back {path}: {reason}")]
  Writeback { path: PathBuf, reason: String },

  #[error("Pipeline already started")]
  AlreadyStarted,
}

impl From<TreeError> for PipelineError {
  fn from(err: TreeError) -> Self {
    Self::Scheduler(SchedulerError::Tree(err))
  }
}

// ============================================================================
// Writeback
// ============================================================================

/// Persists caller-supplied results back into a file
#[async_trait]
pub trait Writeback: Send + Sync {
  async fn write(&self, path: &Path, data: &WritebackData) -> Result<(), String>;
}

/// Records writebacks in the log without touching the file
#[derive(Debug, Default)]
pub struct LogWriteback;

#[async_trait]
impl Writeback for LogWriteback {
  async fn write(&self, path: &Path, data: &WritebackData) -> Result<(), String> {
    info!(
      path = %path.display(),
      rdf_types = ?data.rdf_types,
      rows = data.results.len(),
      "Writeback requested"
    );
    Ok(())
  }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct PipelineStats {
  indexed: AtomicU64,
  deleted: AtomicU64,
  moved: AtomicU64,
  failed: AtomicU64,
  no_backend: AtomicU64,
  discarded: AtomicU64,
  writebacks: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
  pub indexed: u64,
  pub deleted: u64,
  pub moved: u64,
  pub failed: u64,
  pub no_backend: u64,
  pub discarded: u64,
  pub writebacks: u64,
}

impl PipelineStats {
  fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      indexed: self.indexed.load(Ordering::Relaxed),
      deleted: self.deleted.load(Ordering::Relaxed),
      moved: self.moved.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
      no_backend: self.no_backend.load(Ordering::Relaxed),
      discarded: self.discarded.load(Ordering::Relaxed),
      writebacks: self.writebacks.load(Ordering::Relaxed),
    }
  }
}

/// Everything `status` reports
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatus {
  pub state: SchedulerState,
  pub throttle: f64,
  pub queued: usize,
  pub in_flight: usize,
  pub roots: usize,
  pub clients: usize,
  pub backends: Vec<String>,
  pub stats: StatsSnapshot,
}

/// How one work item ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
  Indexed,
  NoBackend,
  Deleted,
  Moved,
  Failed,
  Discarded,
  Writeback,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub scheduler: SchedulerConfig,
  pub dispatcher: DispatcherConfig,
  pub tracker: TrackerConfig,
  pub max_in_flight: usize,
  pub ignore_hidden: bool,
  pub watch: bool,
}

impl PipelineConfig {
  pub fn from_config(config: &Config) -> Self {
    Self {
      scheduler: SchedulerConfig {
        max_throttle_delay: config.index.max_throttle_delay(),
        initial_throttle: config.index.initial_throttle,
      },
      dispatcher: DispatcherConfig::from(&config.dispatch),
      tracker: TrackerConfig::from(&config.tracker),
      max_in_flight: config.dispatch.effective_max_in_flight(),
      ignore_hidden: config.index.ignore_hidden,
      watch: config.index.watch,
    }
  }
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self::from_config(&Config::default())
  }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
  scheduler: Arc<CrawlScheduler>,
  dispatcher: ExtractionDispatcher,
  store: Arc<dyn Store>,
  tree: SharedTree,
  tracker: RequestTracker,
  writeback: Arc<dyn Writeback>,
  watcher: OnceLock<WatcherHandle>,
  started: AtomicBool,
  stats: PipelineStats,
  max_in_flight: usize,
  ignore_hidden: bool,
  watch: bool,
  cancel: CancellationToken,
}

impl Pipeline {
  /// Wire up the components. Nothing is dequeued until [`Pipeline::start`].
  pub fn new(
    store: Arc<dyn Store>,
    registry: BackendRegistry,
    resolver: Arc<dyn IdentityResolver>,
    writeback: Arc<dyn Writeback>,
    config: PipelineConfig,
    cancel: CancellationToken,
  ) -> Arc<Self> {
    let tree: SharedTree = Arc::new(parking_lot::RwLock::new(IndexingTree::new()));
    let scheduler = CrawlScheduler::new(
      Arc::clone(&tree),
      Arc::clone(&store),
      config.scheduler,
      cancel.child_token(),
    );
    let dispatcher = ExtractionDispatcher::new(registry, config.dispatcher, cancel.child_token());
    let tracker = RequestTracker::new(resolver, config.tracker, cancel.child_token());

    Arc::new(Self {
      scheduler,
      dispatcher,
      store,
      tree,
      tracker,
      writeback,
      watcher: OnceLock::new(),
      started: AtomicBool::new(false),
      stats: PipelineStats::default(),
      max_in_flight: config.max_in_flight.max(1),
      ignore_hidden: config.ignore_hidden,
      watch: config.watch,
      cancel,
    })
  }

  /// Build from the user config: the backend table is validated here and a
  /// malformed one is fatal.
  pub fn from_config(config: &Config, store: Arc<dyn Store>, cancel: CancellationToken) -> Result<Arc<Self>, PipelineError> {
    config.validate()?;
    let registry = BackendRegistry::from_table(&config.backends)?;
    Ok(Self::new(
      store,
      registry,
      Arc::new(ProcIdentityResolver),
      Arc::new(LogWriteback),
      PipelineConfig::from_config(config),
      cancel,
    ))
  }

  /// Start the drain loop and the watcher, then register `roots`.
  ///
  /// Every root is checked before any of them is crawled. A pipeline starts
  /// once; later calls fail with [`PipelineError::AlreadyStarted`].
  pub async fn start(self: &Arc<Self>, roots: &[RootConfig]) -> Result<JoinHandle<()>, PipelineError> {
    for root in roots {
      let is_dir = tokio::fs::metadata(&root.path).await.is_ok_and(|m| m.is_dir());
      if !is_dir {
        return Err(
          ConfigError::InvalidRoot {
            path: root.path.clone(),
            reason: "not an existing directory".to_string(),
          }
          .into(),
        );
      }
      self.root_filter(&root.exclude_globs, &root.exclude_mime)?;
    }

    if self.started.swap(true, Ordering::SeqCst) {
      return Err(PipelineError::AlreadyStarted);
    }

    if self.watch {
      match WatcherTask::spawn(Arc::clone(&self.scheduler), self.cancel.child_token()) {
        Ok((handle, _task)) => {
          let _ = self.watcher.set(handle);
        }
        Err(e) => {
          self.started.store(false, Ordering::SeqCst);
          return Err(e.into());
        }
      }
    }

    let drain = tokio::spawn(Arc::clone(self).drain());

    for root in roots {
      self
        .add_filtered_root(root.path.clone(), root.recurse, &root.exclude_globs, &root.exclude_mime)
        .await?;
    }

    info!(roots = roots.len(), watch = self.watch, "Pipeline started");
    Ok(drain)
  }

  pub fn scheduler(&self) -> &Arc<CrawlScheduler> {
    &self.scheduler
  }

  pub fn tracker(&self) -> &RequestTracker {
    &self.tracker
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.stats.snapshot()
  }

  // --------------------------------------------------------------------------
  // Drain loop
  // --------------------------------------------------------------------------

  async fn drain(self: Arc<Self>) {
    let permits = Arc::new(Semaphore::new(self.max_in_flight));
    debug!(max_in_flight = self.max_in_flight, "Drain loop started");

    loop {
      let permit = tokio::select! {
        biased;
        _ = self.cancel.cancelled() => break,
        permit = Arc::clone(&permits).acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => break,
        },
      };

      let item = tokio::select! {
        biased;
        _ = self.cancel.cancelled() => break,
        item = self.scheduler.next_item() => item,
      };

      let this = Arc::clone(&self);
      tokio::spawn(async move {
        // The path is released even if processing panics
        let worker = Arc::clone(&this);
        let claimed = item.clone();
        if let Err(e) = tokio::spawn(async move { worker.process(&claimed).await }).await {
          warn!(path = %item.target.display(), kind = ?item.kind, error = %e, "Work item aborted");
          PipelineStats::bump(&this.stats.failed);
        }
        this.scheduler.complete(&item);
        drop(permit);
      });
    }

    debug!("Drain loop stopped");
  }

  async fn process(&self, item: &WorkItem) {
    let started = Instant::now();
    let outcome = match item.kind {
      WorkKind::Created | WorkKind::Updated | WorkKind::AttributeChanged => self.index_path(&item.target).await,
      WorkKind::Deleted | WorkKind::MovedFrom => self.delete_path(&item.target).await,
      WorkKind::MovedTo => match &item.partner {
        Some(origin) => self.move_path(origin, &item.target).await,
        None => self.index_path(&item.target).await,
      },
      WorkKind::Writeback => self.write_back(item).await,
    };

    let outcome = outcome.unwrap_or_else(|e| {
      warn!(path = %item.target.display(), kind = ?item.kind, error = %e, "Work item failed");
      Outcome::Failed
    });

    let counter = match outcome {
      Outcome::Indexed => &self.stats.indexed,
      Outcome::NoBackend => &self.stats.no_backend,
      Outcome::Deleted => &self.stats.deleted,
      Outcome::Moved => &self.stats.moved,
      Outcome::Failed => &self.stats.failed,
      Outcome::Discarded => &self.stats.discarded,
      Outcome::Writeback => &self.stats.writebacks,
    };
    PipelineStats::bump(counter);

    trace!(
      path = %item.target.display(),
      kind = ?item.kind,
      ?outcome,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "Work item done"
    );
  }

  fn uri_for(path: &Path) -> Result<String, PipelineError> {
    content::path_to_uri(path).ok_or_else(|| PipelineError::InvalidUri(path.display().to_string()))
  }

  async fn index_path(&self, path: &Path) -> Result<Outcome, PipelineError> {
    if !self.scheduler.is_in_scope(path) {
      return Ok(Outcome::Discarded);
    }

    let metadata = match tokio::fs::metadata(path).await {
      Ok(metadata) => metadata,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = %path.display(), "File vanished before indexing");
        return self.delete_path(path).await;
      }
      Err(e) => {
        return Err(
          SchedulerError::Io {
            path: path.to_path_buf(),
            source: e,
          }
          .into(),
        );
      }
    };

    let uri = Self::uri_for(path)?;
    let content_type = content::guess(path, metadata.is_dir());
    let outcome = self.dispatcher.dispatch(path, &content_type).await;

    // The root may have been removed while the backend ran
    if !self.scheduler.is_in_scope(path) {
      debug!(path = %path.display(), "Root removed during extraction, discarding result");
      return Ok(Outcome::Discarded);
    }

    let mut facts = vec![
      Statement::new(predicate::URL, &uri),
      Statement::new(predicate::MIME_TYPE, &content_type),
      Statement::new(predicate::FILE_SIZE, metadata.len()),
    ];
    if let Ok(modified) = metadata.modified() {
      facts.push(Statement::new(predicate::LAST_MODIFIED, content::format_mtime(modified)));
    }
    if let Some(container) = path.parent().and_then(content::path_to_uri) {
      facts.push(Statement::new(predicate::CONTAINER, container));
    }

    let outcome = match outcome {
      DispatchOutcome::Extracted { backend, facts: extracted } => {
        trace!(path = %path.display(), %backend, facts = extracted.len(), "Extracted");
        facts.extend(extracted);
        Outcome::Indexed
      }
      DispatchOutcome::NoBackend { content_type } => {
        debug!(path = %path.display(), %content_type, "No backend, storing file facts only");
        Outcome::NoBackend
      }
      DispatchOutcome::Failed { backend, error } => {
        warn!(path = %path.display(), %backend, error = %error, "Extraction failed");
        return Ok(Outcome::Failed);
      }
    };

    self.store.submit_facts(&uri, facts).await?;
    Ok(outcome)
  }

  async fn delete_path(&self, path: &Path) -> Result<Outcome, PipelineError> {
    let uri = Self::uri_for(path)?;
    for row in self.store.run_query(&Query::Descendants(uri.clone())).await? {
      self.store.submit_deletion(&row.uri).await?;
    }
    self.store.submit_deletion(&uri).await?;
    Ok(Outcome::Deleted)
  }

  async fn move_path(&self, from: &Path, to: &Path) -> Result<Outcome, PipelineError> {
    let from_uri = Self::uri_for(from)?;
    let to_uri = Self::uri_for(to)?;
    self.store.submit_move(&from_uri, &to_uri).await?;
    debug!(from = %from.display(), to = %to.display(), "Moved in store");

    // The new name may imply a different content type
    match self.index_path(to).await? {
      Outcome::Indexed | Outcome::NoBackend => Ok(Outcome::Moved),
      other => Ok(other),
    }
  }

  async fn write_back(&self, item: &WorkItem) -> Result<Outcome, PipelineError> {
    let Some(data) = &item.writeback else {
      return Ok(Outcome::Discarded);
    };
    self
      .writeback
      .write(&item.target, data)
      .await
      .map_err(|reason| PipelineError::Writeback {
        path: item.target.clone(),
        reason,
      })?;
    Ok(Outcome::Writeback)
  }

  // --------------------------------------------------------------------------
  // Control operations
  // --------------------------------------------------------------------------

  fn root_filter(&self, exclude_globs: &[String], exclude_mime: &[String]) -> Result<RootFilter, PipelineError> {
    Ok(RootFilter::new(exclude_globs, exclude_mime, self.ignore_hidden)?)
  }

  async fn add_filtered_root(
    &self,
    path: PathBuf,
    recurse: bool,
    exclude_globs: &[String],
    exclude_mime: &[String],
  ) -> Result<(), PipelineError> {
    let filter = self.root_filter(exclude_globs, exclude_mime)?;
    self.scheduler.add_directory(path.clone(), recurse, filter).await?;

    if let Some(watcher) = self.watcher.get()
      && let Err(e) = watcher.watch(path.clone(), recurse).await
    {
      warn!(root = %path.display(), error = %e, "Root added but not watched");
    }
    Ok(())
  }

  pub async fn add_directory(&self, path: PathBuf, recurse: bool, exclude_globs: &[String]) -> Result<(), PipelineError> {
    self.add_filtered_root(path, recurse, exclude_globs, &[]).await
  }

  /// Returns how many queued items were dropped
  pub async fn remove_directory(&self, path: &Path, cascade: bool) -> Result<usize, PipelineError> {
    let dropped = self.scheduler.remove_directory(path, cascade).await?;
    if let Some(watcher) = self.watcher.get()
      && let Err(e) = watcher.unwatch(path.to_path_buf()).await
    {
      warn!(root = %path.display(), error = %e, "Failed to unwatch removed root");
    }
    Ok(dropped)
  }

  /// Re-index one file (or directory) now. Accepts a `file://` URI or an
  /// absolute path.
  pub async fn index_file(&self, target: &str) -> Result<(), PipelineError> {
    let path = if target.starts_with("file:") {
      content::uri_to_path(target).ok_or_else(|| PipelineError::InvalidUri(target.to_string()))?
    } else {
      PathBuf::from(target)
    };
    if !path.is_absolute() {
      return Err(PipelineError::InvalidUri(target.to_string()));
    }

    if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
      self.scheduler.check_directory(&path, priority::URGENT, true).await?;
    } else {
      self.scheduler.check_file(&path, priority::URGENT, true).await?;
    }
    Ok(())
  }

  /// Re-queue every indexed file whose content type matches. Returns the
  /// number of files queued.
  pub async fn reindex_content_types(&self, types: &[String]) -> Result<usize, PipelineError> {
    if types.is_empty() {
      return Err(PipelineError::InvalidPattern("no content types given".to_string()));
    }
    for raw in types {
      MimePattern::parse(raw).map_err(|e| PipelineError::InvalidPattern(e.to_string()))?;
    }

    let rows = self.store.run_query(&Query::ContentTypes(types.to_vec())).await?;
    let mut queued = 0usize;
    for row in rows {
      let Some(path) = content::uri_to_path(&row.uri) else {
        continue;
      };
      match self.scheduler.check_file(&path, priority::DEFAULT, false).await {
        Ok(()) => queued += 1,
        Err(e) => debug!(path = %path.display(), error = %e, "Skipping re-index"),
      }
    }

    info!(types = ?types, queued, "Re-index by content type");
    Ok(queued)
  }

  pub fn notify_writeback(&self, path: &Path, rdf_types: Vec<String>, results: Vec<Vec<String>>) -> Result<(), PipelineError> {
    Ok(self.scheduler.notify_writeback(path, rdf_types, results)?)
  }

  pub fn set_throttle(&self, factor: f64) -> Result<f64, PipelineError> {
    Ok(self.scheduler.set_throttle(factor)?)
  }

  pub fn pause(&self) {
    self.scheduler.pause();
  }

  pub fn resume(&self) {
    self.scheduler.resume();
  }

  pub fn roots(&self) -> Vec<RootSummary> {
    self.scheduler.roots()
  }

  pub fn status(&self) -> PipelineStatus {
    PipelineStatus {
      state: self.scheduler.state(),
      throttle: self.scheduler.throttle(),
      queued: self.scheduler.queued(),
      in_flight: self.scheduler.in_flight(),
      roots: self.tree.read().len(),
      clients: self.tracker.client_count(),
      backends: self.dispatcher.registry().names(),
      stats: self.stats.snapshot(),
    }
  }

  /// Resolves once crawls are done and every queued item has been processed
  pub async fn wait_idle(&self) {
    self.scheduler.wait_idle().await;
  }

  pub fn shutdown(&self) {
    info!("Pipeline shutting down");
    self.cancel.cancel();
    self.dispatcher.shutdown();
    self.tracker.shutdown();
  }
}
