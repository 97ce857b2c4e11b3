//! Message types flowing between the watcher, scheduler and pipeline
//!
//! ```text
//! Watcher ──FsEvent──▶ CrawlScheduler ──WorkItem──▶ Pipeline ──▶ Dispatcher ──▶ Store
//!    ▲                      ▲
//!    └──WatchCommand──  Control surface (checkFile, addDirectory, ...)
//! ```

use std::path::PathBuf;

use tokio::time::Instant;

/// Queue priorities. Lower is serviced first.
pub mod priority {
  /// Explicit "index this now" requests
  pub const URGENT: i32 = 0;
  /// Live filesystem changes
  pub const DEFAULT: i32 = 100;
  /// Crawls and parent repair
  pub const BACKGROUND: i32 = 200;
}

// ============================================================================
// Work items
// ============================================================================

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkKind {
  Created,
  Updated,
  Deleted,
  /// The origin half of a move. Acts as a delete of the old path.
  MovedFrom,
  /// The destination half of a move. The store renames rather than recreates.
  MovedTo,
  AttributeChanged,
  Writeback,
}

/// Items collapse per (path, class): at most one content and one writeback item per path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindClass {
  Content,
  Writeback,
}

impl WorkKind {
  pub fn class(self) -> KindClass {
    match self {
      Self::Writeback => KindClass::Writeback,
      _ => KindClass::Content,
    }
  }
}

/// Results handed back to a metadata writer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WritebackData {
  pub rdf_types: Vec<String>,
  pub results: Vec<Vec<String>>,
}

/// A single unit of queued indexing work
#[derive(Debug, Clone)]
pub struct WorkItem {
  pub target: PathBuf,
  pub kind: WorkKind,
  pub priority: i32,
  pub check_parents: bool,
  pub enqueued_at: Instant,
  /// For `MovedFrom`/`MovedTo`, the other half of the move
  pub partner: Option<PathBuf>,
  pub writeback: Option<WritebackData>,
}

impl WorkItem {
  pub fn new(target: PathBuf, kind: WorkKind, priority: i32) -> Self {
    Self {
      target,
      kind,
      priority,
      check_parents: false,
      enqueued_at: Instant::now(),
      partner: None,
      writeback: None,
    }
  }

  pub fn with_check_parents(mut self, check_parents: bool) -> Self {
    self.check_parents = check_parents;
    self
  }

  pub fn with_partner(mut self, partner: PathBuf) -> Self {
    self.partner = Some(partner);
    self
  }

  pub fn with_writeback(mut self, data: WritebackData) -> Self {
    self.writeback = Some(data);
    self
  }
}

// ============================================================================
// Filesystem events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEventKind {
  Created,
  Modified,
  AttributeChanged,
  Removed,
  Moved { to: PathBuf },
}

/// A change reported by the filesystem watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
  pub path: PathBuf,
  pub kind: FsEventKind,
}

impl FsEvent {
  pub fn new(path: impl Into<PathBuf>, kind: FsEventKind) -> Self {
    Self {
      path: path.into(),
      kind,
    }
  }
}

/// Commands for the watcher task
#[derive(Debug, Clone)]
pub enum WatchCommand {
  Watch { root: PathBuf, recursive: bool },
  Unwatch { root: PathBuf },
}
