//! Long-lived tasks that keep the index in step with the filesystem
//!
//! # Components
//!
//! - [`CrawlScheduler`]: owns the work queue, runs crawls, applies throttle and pause
//! - [`ExtractionDispatcher`]: routes each file to a backend under its concurrency model
//! - [`RequestTracker`]: per-client bookkeeping for control requests
//! - [`WatcherTask`]: turns notify events into scheduler events
//! - [`Pipeline`]: wires the above to a [`Store`](crate::store::Store) and drains the queue
//!
//! # Data flow
//!
//! ```text
//! crawl / watcher / control ──▶ WorkQueue ──next_item──▶ drain loop
//!                                   ▲                        │
//!                                   └──────complete──────────┤
//!                                                            ▼
//!                                        ExtractionDispatcher ──▶ Store
//! ```

mod crawler;
pub mod dispatcher;
pub mod handle;
pub mod lifecycle;
pub mod message;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod watcher;

#[cfg(test)]
pub(crate) mod __tests__;

pub use dispatcher::{BackendRegistry, DispatchOutcome, DispatcherConfig, ExtractionDispatcher};
pub use lifecycle::{CallerId, RequestTracker};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineStatus, StatsSnapshot};
pub use scheduler::{CrawlScheduler, RootSummary, SchedulerConfig, SchedulerError, SchedulerState};
pub use watcher::WatcherTask;
