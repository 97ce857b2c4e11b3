//! WatcherTask - feeds filesystem changes into the crawl scheduler
//!
//! One notify watcher covers every indexing root. Roots are (un)watched at
//! runtime through a [`WatcherHandle`].
//!
//! # Design
//!
//! The watcher bridges notify's sync callback with the async side:
//! 1. The callback uses `blocking_send` to forward raw events to a channel
//! 2. The task translates each event into [`FsEvent`]s
//! 3. Translated events go straight to `CrawlScheduler::handle_event`, whose
//!    queue does the coalescing
//!
//! # Renames
//!
//! inotify reports a rename as `From`, then `To`, then `Both` carrying both
//! paths under one tracker cookie. A `From` is held until its `Both` arrives
//! and becomes a single move. A `From` that is never paired (the file left
//! the watched tree) is flushed as a removal after [`MOVE_PAIR_WINDOW`]; an
//! unpaired `To` is a creation.

use std::{
  collections::HashMap,
  path::PathBuf,
  sync::Arc,
  time::{Duration, Instant},
};

use notify::{
  Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
  event::{ModifyKind, RenameMode},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
  handle::WatcherHandle,
  message::{FsEvent, FsEventKind, WatchCommand},
  scheduler::CrawlScheduler,
};

/// How long a rename origin waits for its destination
pub const MOVE_PAIR_WINDOW: Duration = Duration::from_millis(250);

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
  #[error("Failed to initialize watcher: {0}")]
  Init(#[source] notify::Error),

  #[error("Failed to watch {path}: {source}")]
  Watch {
    path: PathBuf,
    #[source]
    source: notify::Error,
  },
}

// ============================================================================
// Event translation
// ============================================================================

/// Turns raw notify events into scheduler events, pairing rename halves
#[derive(Debug, Default)]
struct EventTranslator {
  /// Rename origins waiting for their destination, by tracker cookie
  pending_moves: HashMap<usize, (PathBuf, Instant)>,
}

impl EventTranslator {
  fn translate(&mut self, event: Event, now: Instant) -> Vec<FsEvent> {
    let tracker = event.tracker();
    let mut paths = event.paths;

    match event.kind {
      EventKind::Create(_) => paths.into_iter().map(|p| FsEvent::new(p, FsEventKind::Created)).collect(),

      EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
        let to = paths.swap_remove(1);
        let from = paths.swap_remove(0);
        match tracker {
          Some(cookie) => {
            self.pending_moves.remove(&cookie);
          }
          None => self.pending_moves.retain(|_, (origin, _)| *origin != from),
        }
        debug!(from = %from.display(), to = %to.display(), "Renamed");
        vec![FsEvent::new(from, FsEventKind::Moved { to })]
      }

      EventKind::Modify(ModifyKind::Name(RenameMode::From)) => match tracker {
        Some(cookie) => {
          for path in paths {
            self.pending_moves.insert(cookie, (path, now));
          }
          Vec::new()
        }
        None => paths.into_iter().map(|p| FsEvent::new(p, FsEventKind::Removed)).collect(),
      },

      EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
        // The matching `Both` follows and carries the move
        if tracker.is_some_and(|cookie| self.pending_moves.contains_key(&cookie)) {
          return Vec::new();
        }
        paths.into_iter().map(|p| FsEvent::new(p, FsEventKind::Created)).collect()
      }

      // Backends that can't tell which side of a rename a path is on
      EventKind::Modify(ModifyKind::Name(_)) => paths
        .into_iter()
        .map(|p| {
          let kind = if p.exists() {
            FsEventKind::Created
          } else {
            FsEventKind::Removed
          };
          FsEvent::new(p, kind)
        })
        .collect(),

      EventKind::Modify(ModifyKind::Metadata(_)) => paths
        .into_iter()
        .map(|p| FsEvent::new(p, FsEventKind::AttributeChanged))
        .collect(),

      EventKind::Modify(_) => paths.into_iter().map(|p| FsEvent::new(p, FsEventKind::Modified)).collect(),

      EventKind::Remove(_) => paths.into_iter().map(|p| FsEvent::new(p, FsEventKind::Removed)).collect(),

      EventKind::Access(_) | EventKind::Any | EventKind::Other => {
        trace!(kind = ?event.kind, "Ignoring event");
        Vec::new()
      }
    }
  }

  /// Rename origins whose destination never showed up
  fn flush_expired(&mut self, now: Instant) -> Vec<FsEvent> {
    let expired: Vec<usize> = self
      .pending_moves
      .iter()
      .filter(|(_, (_, seen))| now.duration_since(*seen) >= MOVE_PAIR_WINDOW)
      .map(|(cookie, _)| *cookie)
      .collect();

    expired
      .into_iter()
      .filter_map(|cookie| self.pending_moves.remove(&cookie))
      .map(|(path, _)| {
        trace!(path = %path.display(), "Unpaired rename origin, treating as removal");
        FsEvent::new(path, FsEventKind::Removed)
      })
      .collect()
  }
}

// ============================================================================
// WatcherTask
// ============================================================================

pub struct WatcherTask {
  scheduler: Arc<CrawlScheduler>,
  cancel: CancellationToken,
  // The notify watcher must be held to keep it alive
  watcher: RecommendedWatcher,
  event_rx: mpsc::Receiver<Result<Event, notify::Error>>,
  command_rx: mpsc::Receiver<WatchCommand>,
  translator: EventTranslator,
}

impl WatcherTask {
  pub fn new(
    scheduler: Arc<CrawlScheduler>,
    cancel: CancellationToken,
  ) -> Result<(Self, WatcherHandle), WatcherError> {
    let (event_tx, event_rx) = mpsc::channel::<Result<Event, notify::Error>>(1024);
    let (command_tx, command_rx) = mpsc::channel::<WatchCommand>(32);

    let watcher = RecommendedWatcher::new(
      move |res| {
        // Runs on notify's thread. A closed channel means we're shutting down.
        let _ = event_tx.blocking_send(res);
      },
      Config::default(),
    )
    .map_err(WatcherError::Init)?;

    let task = Self {
      scheduler,
      cancel,
      watcher,
      event_rx,
      command_rx,
      translator: EventTranslator::default(),
    };
    Ok((task, WatcherHandle::new(command_tx)))
  }

  /// Spawn the watcher task, returning the handle used to add and remove roots
  pub fn spawn(
    scheduler: Arc<CrawlScheduler>,
    cancel: CancellationToken,
  ) -> Result<(WatcherHandle, tokio::task::JoinHandle<()>), WatcherError> {
    let (task, handle) = Self::new(scheduler, cancel)?;
    Ok((handle, tokio::spawn(task.run())))
  }

  pub async fn run(mut self) {
    info!("WatcherTask started");
    let mut flush_interval = tokio::time::interval(MOVE_PAIR_WINDOW);

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!("WatcherTask shutting down (cancelled)");
          break;
        }

        command = self.command_rx.recv() => match command {
          Some(command) => self.apply(command),
          None => {
            info!("WatcherTask shutting down (handle dropped)");
            break;
          }
        },

        event = self.event_rx.recv() => match event {
          Some(Ok(event)) => {
            for fs_event in self.translator.translate(event, Instant::now()) {
              self.scheduler.handle_event(fs_event);
            }
          }
          Some(Err(e)) => warn!(error = %e, "Watcher error"),
          None => {
            info!("WatcherTask shutting down (channel closed)");
            break;
          }
        },

        _ = flush_interval.tick() => {
          for fs_event in self.translator.flush_expired(Instant::now()) {
            self.scheduler.handle_event(fs_event);
          }
        }
      }
    }

    info!("WatcherTask stopped");
  }

  fn apply(&mut self, command: WatchCommand) {
    let result = match &command {
      WatchCommand::Watch { root, recursive } => {
        let mode = if *recursive {
          RecursiveMode::Recursive
        } else {
          RecursiveMode::NonRecursive
        };
        self.watcher.watch(root, mode).map(|()| debug!(root = %root.display(), recursive, "Watching root"))
      }
      WatchCommand::Unwatch { root } => self
        .watcher
        .unwatch(root)
        .map(|()| debug!(root = %root.display(), "Stopped watching root")),
    };

    if let Err(source) = result {
      let path = match command {
        WatchCommand::Watch { root, .. } | WatchCommand::Unwatch { root } => root,
      };
      let e = WatcherError::Watch { path, source };
      warn!(error = %e, "Watch command failed");
    }
  }
}
