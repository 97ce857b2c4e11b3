//! CrawlScheduler - turns filesystem reality into an ordered stream of work
//!
//! Sources of work:
//! - Directory crawls started by `add_directory` / `check_directory` / new directories
//! - Watcher events via `handle_event`
//! - Explicit requests: `check_file`, `notify_writeback`
//!
//! The single consumer (the pipeline's drain loop) pulls with `next_item` and
//! reports back with `complete`. Pausing stops dequeuing, never enqueuing.
//!
//! # States
//!
//! ```text
//! Idle ──crawl──▶ Crawling ──crawl done──▶ Draining ──queue + in-flight empty──▶ Idle
//!   any ──pause──▶ Paused ──resume──▶ (recomputed)
//! ```

use std::{
  collections::HashMap,
  fmt,
  path::{Path, PathBuf},
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
  },
  time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{
  crawler,
  message::{FsEvent, FsEventKind, KindClass, WorkItem, WorkKind, WritebackData, priority},
  queue::{PushOutcome, WorkQueue},
};
use crate::{
  domain::{
    content,
    tree::{RootFilter, SharedTree, TreeError},
  },
  store::{Query, Store, StoreError},
};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
  #[error("File does not exist: {0}")]
  NotFound(PathBuf),

  #[error("Not a directory: {0}")]
  NotADirectory(PathBuf),

  #[error("Not eligible for indexing: {0}")]
  NotEligible(PathBuf),

  #[error("Not an indexing root: {0}")]
  NotARoot(PathBuf),

  #[error("Throttle must be a number between 0.0 and 1.0, got {0}")]
  InvalidThrottle(f64),

  #[error("Failed to stat {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Tree(#[from] TreeError),

  #[error(transparent)]
  Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
  Idle,
  Crawling,
  Draining,
  Paused,
}

impl fmt::Display for SchedulerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Idle => "idle",
      Self::Crawling => "crawling",
      Self::Draining => "draining",
      Self::Paused => "paused",
    };
    write!(f, "{s}")
  }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// Delay between dequeues at throttle 1.0
  pub max_throttle_delay: Duration,
  pub initial_throttle: f64,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      max_throttle_delay: Duration::from_secs(1),
      initial_throttle: 0.0,
    }
  }
}

/// A registered root as reported to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSummary {
  pub path: PathBuf,
  pub recurse: bool,
  pub exclude_globs: Vec<String>,
}

async fn stat(path: &Path) -> Result<std::fs::Metadata, SchedulerError> {
  tokio::fs::metadata(path).await.map_err(|source| match source.kind() {
    std::io::ErrorKind::NotFound => SchedulerError::NotFound(path.to_path_buf()),
    _ => SchedulerError::Io {
      path: path.to_path_buf(),
      source,
    },
  })
}

// ============================================================================
// CrawlScheduler
// ============================================================================

pub struct CrawlScheduler {
  queue: Mutex<WorkQueue>,
  tree: SharedTree,
  store: Arc<dyn Store>,
  /// Woken on enqueue, completion, resume, throttle change and crawl end
  ready: Notify,
  throttle: AtomicU64,
  paused: AtomicBool,
  crawls: AtomicUsize,
  crawl_tokens: Mutex<HashMap<PathBuf, (u64, CancellationToken)>>,
  next_crawl_id: AtomicU64,
  last_dequeue: Mutex<Option<Instant>>,
  max_delay: Duration,
  cancel: CancellationToken,
}

impl CrawlScheduler {
  pub fn new(tree: SharedTree, store: Arc<dyn Store>, config: SchedulerConfig, cancel: CancellationToken) -> Arc<Self> {
    Arc::new(Self {
      queue: Mutex::new(WorkQueue::new()),
      tree,
      store,
      ready: Notify::new(),
      throttle: AtomicU64::new(config.initial_throttle.clamp(0.0, 1.0).to_bits()),
      paused: AtomicBool::new(false),
      crawls: AtomicUsize::new(0),
      crawl_tokens: Mutex::new(HashMap::new()),
      next_crawl_id: AtomicU64::new(1),
      last_dequeue: Mutex::new(None),
      max_delay: config.max_throttle_delay,
      cancel,
    })
  }

  pub(super) fn tree(&self) -> &SharedTree {
    &self.tree
  }

  pub(super) fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn is_in_scope(&self, path: &Path) -> bool {
    self.tree.read().is_in_scope(path)
  }

  // --------------------------------------------------------------------------
  // Enqueue side
  // --------------------------------------------------------------------------

  pub(crate) fn enqueue(&self, item: WorkItem) -> PushOutcome {
    let outcome = {
      let mut queue = self.queue.lock();
      if item.kind == WorkKind::Deleted {
        let target = item.target.clone();
        let dropped = queue.remove_where(|p| p != target && p.starts_with(&target));
        if dropped > 0 {
          debug!(path = %target.display(), dropped, "Dropped queued work under deleted path");
        }
      }
      queue.push(item)
    };
    self.ready.notify_waiters();
    outcome
  }

  /// Register a root and crawl it at background priority.
  pub async fn add_directory(
    self: &Arc<Self>,
    path: PathBuf,
    recurse: bool,
    filter: RootFilter,
  ) -> Result<(), SchedulerError> {
    let metadata = stat(&path).await?;
    if !metadata.is_dir() {
      return Err(SchedulerError::NotADirectory(path));
    }

    self.tree.write().add_root(path.clone(), recurse, filter)?;
    info!(root = %path.display(), recurse, "Indexing root added");

    self.spawn_crawl(path, recurse);
    Ok(())
  }

  /// Deregister a root and drop queued work under it. With `cascade`, also
  /// delete whatever the store holds for paths that are now out of scope.
  pub async fn remove_directory(&self, path: &Path, cascade: bool) -> Result<usize, SchedulerError> {
    if !self.tree.write().remove_root(path) {
      return Err(SchedulerError::NotARoot(path.to_path_buf()));
    }

    // Nested roots may still cover part of the subtree
    let tree = self.tree.read().clone();
    let orphaned = |p: &Path| p.starts_with(path) && !tree.is_in_scope(p);

    for (dir, (_, token)) in self.crawl_tokens.lock().iter() {
      if orphaned(dir) {
        token.cancel();
      }
    }

    let dropped = self.queue.lock().remove_where(orphaned);
    self.ready.notify_waiters();
    info!(root = %path.display(), dropped, cascade, "Indexing root removed");

    if cascade && let Some(uri) = content::path_to_uri(path) {
      let rows = self.store.run_query(&Query::Descendants(uri.clone())).await?;
      let mut deleted = 0usize;
      for row in rows {
        let still_covered = content::uri_to_path(&row.uri).is_some_and(|p| !orphaned(&p));
        if !still_covered {
          self.store.submit_deletion(&row.uri).await?;
          deleted += 1;
        }
      }
      if orphaned(path) {
        self.store.submit_deletion(&uri).await?;
      }
      info!(root = %path.display(), deleted, "Cascaded metadata deletion");
    }

    Ok(dropped)
  }

  /// Queue an on-demand re-index of one file.
  pub async fn check_file(&self, path: &Path, priority: i32, check_parents: bool) -> Result<(), SchedulerError> {
    stat(path).await?;
    if !self.is_in_scope(path) {
      return Err(SchedulerError::NotEligible(path.to_path_buf()));
    }

    self.enqueue(WorkItem::new(path.to_path_buf(), WorkKind::Updated, priority).with_check_parents(check_parents));
    if check_parents {
      self.enqueue_parents(path);
    }
    Ok(())
  }

  /// Queue a directory and re-crawl its contents.
  pub async fn check_directory(
    self: &Arc<Self>,
    path: &Path,
    priority: i32,
    check_parents: bool,
  ) -> Result<(), SchedulerError> {
    if !stat(path).await?.is_dir() {
      return Err(SchedulerError::NotADirectory(path.to_path_buf()));
    }

    let recurse = {
      let tree = self.tree.read();
      if !tree.is_in_scope(path) {
        return Err(SchedulerError::NotEligible(path.to_path_buf()));
      }
      tree.matching_root(path).is_some_and(|root| root.recurse)
    };

    if !self.tree.read().is_root(path) {
      self.enqueue(WorkItem::new(path.to_path_buf(), WorkKind::Updated, priority).with_check_parents(check_parents));
    }
    if check_parents {
      self.enqueue_parents(path);
    }
    if recurse || self.tree.read().is_root(path) {
      self.spawn_crawl(path.to_path_buf(), recurse);
    }
    Ok(())
  }

  /// Ancestors between `path` and its root, at background priority
  fn enqueue_parents(&self, path: &Path) {
    let Some(root) = self.tree.read().matching_root(path).map(|r| r.path.clone()) else {
      return;
    };

    for ancestor in path.ancestors().skip(1) {
      if ancestor == root || !ancestor.starts_with(&root) {
        break;
      }
      self.enqueue(WorkItem::new(ancestor.to_path_buf(), WorkKind::Updated, priority::BACKGROUND));
    }
  }

  /// Queue results that must be written back into a file.
  pub fn notify_writeback(
    &self,
    path: &Path,
    rdf_types: Vec<String>,
    results: Vec<Vec<String>>,
  ) -> Result<(), SchedulerError> {
    if !self.is_in_scope(path) {
      return Err(SchedulerError::NotEligible(path.to_path_buf()));
    }

    let data = WritebackData { rdf_types, results };
    self.enqueue(WorkItem::new(path.to_path_buf(), WorkKind::Writeback, priority::DEFAULT).with_writeback(data));
    Ok(())
  }

  /// Translate a watcher event into queued work.
  pub fn handle_event(self: &Arc<Self>, event: FsEvent) {
    let FsEvent { path, kind } = event;

    match kind {
      FsEventKind::Created => self.on_created(path),
      FsEventKind::Modified => self.enqueue_in_scope(path, WorkKind::Updated),
      FsEventKind::AttributeChanged => self.enqueue_in_scope(path, WorkKind::AttributeChanged),
      FsEventKind::Removed => self.enqueue_in_scope(path, WorkKind::Deleted),
      FsEventKind::Moved { to } => {
        let (from_in, to_in) = {
          let tree = self.tree.read();
          (tree.is_in_scope(&path), tree.is_in_scope(&to))
        };

        match (from_in, to_in) {
          (true, true) => {
            debug!(from = %path.display(), to = %to.display(), "Move");
            self.queue.lock().push_move(path, to, priority::DEFAULT);
            self.ready.notify_waiters();
          }
          (true, false) => self.enqueue_in_scope(path, WorkKind::Deleted),
          (false, true) => self.on_created(to),
          (false, false) => trace!(from = %path.display(), to = %to.display(), "Ignoring move outside roots"),
        }
      }
    }
  }

  fn enqueue_in_scope(&self, path: PathBuf, kind: WorkKind) {
    if !self.is_in_scope(&path) {
      trace!(path = %path.display(), ?kind, "Ignoring event outside roots");
      return;
    }
    self.enqueue(WorkItem::new(path, kind, priority::DEFAULT));
  }

  fn on_created(self: &Arc<Self>, path: PathBuf) {
    let recurse = {
      let tree = self.tree.read();
      if !tree.is_in_scope(&path) {
        trace!(path = %path.display(), "Ignoring create outside roots");
        return;
      }
      tree.matching_root(&path).is_some_and(|root| root.recurse)
    };

    let is_dir = path.is_dir();
    self.enqueue(WorkItem::new(path.clone(), WorkKind::Created, priority::DEFAULT));
    if is_dir && recurse {
      self.spawn_crawl(path, recurse);
    }
  }

  // --------------------------------------------------------------------------
  // Crawls
  // --------------------------------------------------------------------------

  fn spawn_crawl(self: &Arc<Self>, dir: PathBuf, recurse: bool) {
    let token = self.cancel.child_token();
    let id = self.next_crawl_id.fetch_add(1, Ordering::Relaxed);

    if let Some((_, previous)) = self.crawl_tokens.lock().insert(dir.clone(), (id, token.clone())) {
      previous.cancel();
    }
    self.crawls.fetch_add(1, Ordering::SeqCst);

    let this = Arc::clone(self);
    tokio::spawn(async move {
      let started = Instant::now();
      let summary = crawler::crawl(&this, &dir, recurse, &token).await;
      info!(
        dir = %dir.display(),
        visited = summary.visited,
        queued = summary.queued,
        unchanged = summary.unchanged,
        errors = summary.errors,
        cancelled = token.is_cancelled(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Crawl finished"
      );
      this.finish_crawl(&dir, id);
    });
  }

  fn finish_crawl(&self, dir: &Path, id: u64) {
    {
      let mut tokens = self.crawl_tokens.lock();
      if tokens.get(dir).is_some_and(|(current, _)| *current == id) {
        tokens.remove(dir);
      }
    }
    self.crawls.fetch_sub(1, Ordering::SeqCst);
    self.ready.notify_waiters();
  }

  /// Resolves once no crawl is running
  pub async fn wait_for_crawls(&self) {
    loop {
      let notified = self.ready.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if self.crawls.load(Ordering::SeqCst) == 0 {
        return;
      }
      notified.await;
    }
  }

  /// Resolves once no crawl is running and nothing is queued or in flight
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.ready.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if self.crawls.load(Ordering::SeqCst) == 0 && !self.has_pending_work() {
        return;
      }
      notified.await;
    }
  }

  // --------------------------------------------------------------------------
  // Dequeue side
  // --------------------------------------------------------------------------

  /// Wait for the next dispatchable item, honoring pause and throttle.
  pub async fn next_item(&self) -> WorkItem {
    loop {
      let notified = self.ready.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if !self.is_paused() {
        let delay = self.throttle_delay();
        let due = (*self.last_dequeue.lock()).map(|last| last + delay);

        if let Some(due) = due
          && !delay.is_zero()
          && Instant::now() < due
        {
          tokio::select! {
            _ = tokio::time::sleep_until(due) => {}
            _ = &mut notified => {}
          }
          continue;
        }

        let popped = self.queue.lock().pop_ready();
        if let Some(item) = popped {
          *self.last_dequeue.lock() = Some(Instant::now());
          trace!(path = %item.target.display(), kind = ?item.kind, priority = item.priority, "Dequeued");
          return item;
        }
      }

      notified.await;
    }
  }

  /// Release an item returned by `next_item`.
  pub fn complete(&self, item: &WorkItem) {
    self.queue.lock().complete(item);
    self.ready.notify_waiters();
  }

  // --------------------------------------------------------------------------
  // Throttle / pause
  // --------------------------------------------------------------------------

  pub fn set_throttle(&self, factor: f64) -> Result<f64, SchedulerError> {
    if !(0.0..=1.0).contains(&factor) {
      return Err(SchedulerError::InvalidThrottle(factor));
    }
    self.throttle.store(factor.to_bits(), Ordering::SeqCst);
    self.ready.notify_waiters();
    info!(factor, "Throttle set");
    Ok(factor)
  }

  pub fn throttle(&self) -> f64 {
    f64::from_bits(self.throttle.load(Ordering::SeqCst))
  }

  fn throttle_delay(&self) -> Duration {
    self.max_delay.mul_f64(self.throttle())
  }

  pub fn pause(&self) {
    if !self.paused.swap(true, Ordering::SeqCst) {
      info!("Scheduler paused");
    }
  }

  pub fn resume(&self) {
    if self.paused.swap(false, Ordering::SeqCst) {
      info!("Scheduler resumed");
    }
    self.ready.notify_waiters();
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::SeqCst)
  }

  // --------------------------------------------------------------------------
  // Introspection
  // --------------------------------------------------------------------------

  pub fn state(&self) -> SchedulerState {
    if self.is_paused() {
      SchedulerState::Paused
    } else if self.crawls.load(Ordering::SeqCst) > 0 {
      SchedulerState::Crawling
    } else if self.has_pending_work() {
      SchedulerState::Draining
    } else {
      SchedulerState::Idle
    }
  }

  pub fn has_pending_work(&self) -> bool {
    self.queue.lock().has_pending_work()
  }

  pub fn queued(&self) -> usize {
    self.queue.lock().len()
  }

  pub fn in_flight(&self) -> usize {
    self.queue.lock().in_flight()
  }

  pub fn pending_kind(&self, path: &Path) -> Option<WorkKind> {
    self.queue.lock().pending(path, KindClass::Content).map(|item| item.kind)
  }

  pub fn roots(&self) -> Vec<RootSummary> {
    self
      .tree
      .read()
      .roots()
      .map(|root| RootSummary {
        path: root.path.clone(),
        recurse: root.recurse,
        exclude_globs: root.filter.globs().to_vec(),
      })
      .collect()
  }
}
