//! Control surface - executes IPC requests against the pipeline
//!
//! Every request is bracketed by `RequestTracker::begin_request` /
//! `end_request`, so each call is logged with its caller and outcome. Failures
//! come back as a [`ControlError`] with a JSON-RPC style code.

use std::{fmt, path::PathBuf, sync::Arc, time::Instant};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
  actor::{CallerId, Pipeline, PipelineError, SchedulerError},
  ipc::{
    RequestData, ResponseData,
    index::{IndexFileResult, IndexRequest, IndexResponse, ReindexResult},
    roots::{RootAddResult, RootInfo, RootListResult, RootRemoveResult, RootsRequest, RootsResponse},
    system::{StateResult, StatusResult, SystemRequest, SystemResponse, ThrottleResult},
  },
};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error("{0}")]
  NotFound(String),

  #[error("Internal error: {0}")]
  Internal(String),
}

impl ControlError {
  pub fn code(&self) -> i32 {
    match self {
      ControlError::InvalidArgument(_) => -32602,
      ControlError::NotFound(_) => -32004,
      ControlError::Internal(_) => -32000,
    }
  }
}

impl From<PipelineError> for ControlError {
  fn from(err: PipelineError) -> Self {
    let message = err.to_string();
    match err {
      PipelineError::Scheduler(SchedulerError::NotFound(_)) => ControlError::NotFound(message),
      PipelineError::Scheduler(
        SchedulerError::NotADirectory(_)
        | SchedulerError::NotEligible(_)
        | SchedulerError::NotARoot(_)
        | SchedulerError::InvalidThrottle(_)
        | SchedulerError::Tree(_),
      )
      | PipelineError::Config(_)
      | PipelineError::InvalidUri(_)
      | PipelineError::InvalidPattern(_) => ControlError::InvalidArgument(message),
      PipelineError::Scheduler(SchedulerError::Io { .. } | SchedulerError::Store(_))
      | PipelineError::Store(_)
      | PipelineError::Watcher(_)
      | PipelineError::Writeback { .. }
      | PipelineError::AlreadyStarted => ControlError::Internal(message),
    }
  }
}

// ============================================================================
// Control
// ============================================================================

pub struct Control {
  pipeline: Arc<Pipeline>,
  /// Cancelled by a `shutdown` request
  shutdown: CancellationToken,
  started: Instant,
}

impl Control {
  pub fn new(pipeline: Arc<Pipeline>, shutdown: CancellationToken) -> Self {
    Self {
      pipeline,
      shutdown,
      started: Instant::now(),
    }
  }

  pub fn pipeline(&self) -> &Arc<Pipeline> {
    &self.pipeline
  }

  /// Execute one request on behalf of `caller`.
  pub async fn handle(&self, caller: &CallerId, data: RequestData) -> Result<ResponseData, ControlError> {
    let tracker = self.pipeline.tracker();
    let handle = tracker.begin_request(caller, data.describe()).await;

    let result = self.execute(data).await;
    match &result {
      Ok(_) => tracker.end_request(handle, None),
      Err(e) => tracker.end_request(handle, Some(e as &dyn fmt::Display)),
    }
    result
  }

  async fn execute(&self, data: RequestData) -> Result<ResponseData, ControlError> {
    match data {
      RequestData::Index(request) => self.index(request).await.map(ResponseData::Index),
      RequestData::Roots(request) => self.roots(request).await.map(ResponseData::Roots),
      RequestData::System(request) => self.system(request).map(ResponseData::System),
    }
  }

  async fn index(&self, request: IndexRequest) -> Result<IndexResponse, ControlError> {
    match request {
      IndexRequest::ReindexContentTypes(params) => {
        let queued = self.pipeline.reindex_content_types(&params.types).await?;
        Ok(IndexResponse::ReindexContentTypes(ReindexResult { queued }))
      }
      IndexRequest::IndexFile(params) => {
        self.pipeline.index_file(&params.uri).await?;
        Ok(IndexResponse::IndexFile(IndexFileResult { uri: params.uri }))
      }
    }
  }

  async fn roots(&self, request: RootsRequest) -> Result<RootsResponse, ControlError> {
    match request {
      RootsRequest::Add(params) => {
        let path = absolute(&params.path)?;
        self
          .pipeline
          .add_directory(path, params.recurse, &params.exclude_globs)
          .await?;
        Ok(RootsResponse::Add(RootAddResult { path: params.path }))
      }
      RootsRequest::Remove(params) => {
        let path = absolute(&params.path)?;
        let dropped = self.pipeline.remove_directory(&path, params.cascade).await?;
        Ok(RootsResponse::Remove(RootRemoveResult {
          path: params.path,
          dropped,
        }))
      }
      RootsRequest::List(_) => {
        let roots = self.pipeline.roots().into_iter().map(RootInfo::from).collect();
        Ok(RootsResponse::List(RootListResult { roots }))
      }
    }
  }

  fn system(&self, request: SystemRequest) -> Result<SystemResponse, ControlError> {
    match request {
      SystemRequest::Ping(_) => Ok(SystemResponse::Ping("pong".to_string())),
      SystemRequest::Status(_) => Ok(SystemResponse::Status(StatusResult::new(
        self.pipeline.status(),
        self.started.elapsed().as_secs(),
      ))),
      SystemRequest::Throttle(params) => {
        let factor = self.pipeline.set_throttle(params.factor)?;
        Ok(SystemResponse::Throttle(ThrottleResult { factor }))
      }
      SystemRequest::Pause(_) => {
        self.pipeline.pause();
        Ok(SystemResponse::Pause(StateResult {
          state: self.pipeline.status().state,
        }))
      }
      SystemRequest::Resume(_) => {
        self.pipeline.resume();
        Ok(SystemResponse::Resume(StateResult {
          state: self.pipeline.status().state,
        }))
      }
      SystemRequest::Shutdown(_) => {
        info!("Shutdown requested");
        self.shutdown.cancel();
        Ok(SystemResponse::Shutdown {
          message: "shutting down".to_string(),
        })
      }
    }
  }
}

fn absolute(raw: &str) -> Result<PathBuf, ControlError> {
  let path = PathBuf::from(raw);
  if path.is_absolute() {
    Ok(path)
  } else {
    Err(ControlError::InvalidArgument(format!("path must be absolute: {raw}")))
  }
}
