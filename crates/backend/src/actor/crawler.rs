//! Directory crawl - enumerate a subtree and queue what changed
//!
//! The walk runs on a blocking thread (`ignore::WalkBuilder`) and streams
//! entries back over a channel. The async side compares each entry's mtime
//! with what the store remembers and queues `Created` (unknown), `Updated`
//! (changed) or nothing (unchanged), all at background priority.
//!
//! An unreadable directory is logged and skipped; its siblings are still
//! crawled.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::SystemTime,
};

use ignore::WalkBuilder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
  message::{WorkItem, WorkKind, priority},
  scheduler::CrawlScheduler,
};
use crate::domain::content;

#[derive(Debug)]
struct CrawlEntry {
  path: PathBuf,
  modified: Option<SystemTime>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CrawlSummary {
  pub visited: usize,
  pub queued: usize,
  pub unchanged: usize,
  pub errors: usize,
}

pub(super) async fn crawl(
  scheduler: &CrawlScheduler,
  dir: &Path,
  recurse: bool,
  cancel: &CancellationToken,
) -> CrawlSummary {
  let mut summary = CrawlSummary::default();
  let (tx, mut rx) = mpsc::channel::<Result<CrawlEntry, ignore::Error>>(256);

  let tree = Arc::clone(scheduler.tree());
  let walk_root = dir.to_path_buf();
  let walk_cancel = cancel.clone();

  let walker = tokio::task::spawn_blocking(move || {
    let mut builder = WalkBuilder::new(&walk_root);
    builder
      .standard_filters(false)
      .follow_links(false)
      .sort_by_file_name(|a, b| a.cmp(b))
      .filter_entry(move |entry| tree.read().is_in_scope(entry.path()));
    if !recurse {
      builder.max_depth(Some(1));
    }

    for result in builder.build() {
      if walk_cancel.is_cancelled() {
        break;
      }

      let message = match result {
        Ok(entry) if entry.depth() == 0 => continue,
        Ok(entry) => {
          let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
          Ok(CrawlEntry {
            path: entry.into_path(),
            modified,
          })
        }
        Err(e) => Err(e),
      };

      // Receiver gone means the crawl was cancelled
      if tx.blocking_send(message).is_err() {
        break;
      }
    }
  });

  loop {
    let message = tokio::select! {
      biased;

      _ = cancel.cancelled() => {
        debug!(dir = %dir.display(), "Crawl cancelled");
        break;
      }

      message = rx.recv() => message,
    };

    match message {
      Some(Ok(entry)) => {
        summary.visited += 1;
        match classify(scheduler, &entry).await {
          Some(kind) => {
            scheduler.enqueue(WorkItem::new(entry.path, kind, priority::BACKGROUND));
            summary.queued += 1;
          }
          None => summary.unchanged += 1,
        }
      }
      Some(Err(e)) => {
        warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
        summary.errors += 1;
      }
      None => break,
    }
  }

  drop(rx);
  if let Err(e) = walker.await {
    warn!(dir = %dir.display(), error = %e, "Crawl walker task failed");
  }

  summary
}

/// `None` when the store already has this exact version of the file
async fn classify(scheduler: &CrawlScheduler, entry: &CrawlEntry) -> Option<WorkKind> {
  let Some(uri) = content::path_to_uri(&entry.path) else {
    return Some(WorkKind::Created);
  };

  match scheduler.store().lookup(&uri).await {
    Ok(None) => Some(WorkKind::Created),
    Ok(Some(indexed)) => {
      let current = entry.modified.map(content::format_mtime);
      if current.is_some() && indexed.last_modified == current {
        None
      } else {
        Some(WorkKind::Updated)
      }
    }
    Err(e) => {
      warn!(path = %entry.path.display(), error = %e, "Store lookup failed, re-indexing");
      Some(WorkKind::Updated)
    }
  }
}
