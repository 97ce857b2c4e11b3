//! System IPC types - daemon status, throttling and lifecycle
use serde::{Deserialize, Serialize};

use crate::actor::{PipelineStatus, SchedulerState, StatsSnapshot};

// ============================================================================
// Request/Response enums (matches pattern of other method groups)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "params")]
pub enum SystemRequest {
  Ping(PingParams),
  Status(StatusParams),
  Throttle(ThrottleParams),
  Pause(PauseParams),
  Resume(ResumeParams),
  Shutdown(ShutdownParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "data")]
pub enum SystemResponse {
  Ping(String),
  Status(StatusResult),
  Throttle(ThrottleResult),
  Pause(StateResult),
  Resume(StateResult),
  Shutdown { message: String },
}

// ============================================================================
// Request param types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PingParams;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusParams;

/// 0.0 runs at full speed, 1.0 waits the configured maximum between items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleParams {
  pub factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PauseParams;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResumeParams;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShutdownParams;

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
  pub version: String,
  pub uptime_seconds: u64,
  pub state: SchedulerState,
  pub throttle: f64,
  pub queued: usize,
  pub in_flight: usize,
  pub roots: usize,
  pub clients: usize,
  pub backends: Vec<String>,
  pub stats: StatsSnapshot,
}

impl StatusResult {
  pub fn new(status: PipelineStatus, uptime_seconds: u64) -> Self {
    Self {
      version: env!("CARGO_PKG_VERSION").to_string(),
      uptime_seconds,
      state: status.state,
      throttle: status.throttle,
      queued: status.queued,
      in_flight: status.in_flight,
      roots: status.roots,
      clients: status.clients,
      backends: status.backends,
      stats: status.stats,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleResult {
  /// The factor now in effect
  pub factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResult {
  pub state: SchedulerState,
}

// ============================================================================
// IpcRequest implementations
// ============================================================================

use crate::{
  impl_ipc_request,
  ipc::{RequestData, ResponseData},
};

impl_ipc_request!(
  PingParams => String,
  ResponseData::System(SystemResponse::Ping(v)) => v,
  v => RequestData::System(SystemRequest::Ping(v)),
  v => ResponseData::System(SystemResponse::Ping(v))
);
impl_ipc_request!(
  StatusParams => StatusResult,
  ResponseData::System(SystemResponse::Status(v)) => v,
  v => RequestData::System(SystemRequest::Status(v)),
  v => ResponseData::System(SystemResponse::Status(v))
);
impl_ipc_request!(
  ThrottleParams => ThrottleResult,
  ResponseData::System(SystemResponse::Throttle(v)) => v,
  v => RequestData::System(SystemRequest::Throttle(v)),
  v => ResponseData::System(SystemResponse::Throttle(v))
);
impl_ipc_request!(
  PauseParams => StateResult,
  ResponseData::System(SystemResponse::Pause(v)) => v,
  v => RequestData::System(SystemRequest::Pause(v))
);
impl_ipc_request!(
  ResumeParams => StateResult,
  ResponseData::System(SystemResponse::Resume(v)) => v,
  v => RequestData::System(SystemRequest::Resume(v))
);
impl_ipc_request!(
  ShutdownParams => String,
  ResponseData::System(SystemResponse::Shutdown { message }) => message,
  v => RequestData::System(SystemRequest::Shutdown(v))
);
