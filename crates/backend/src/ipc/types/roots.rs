//! Roots IPC types - adding, removing and listing indexing roots
use serde::{Deserialize, Serialize};

use crate::{
  actor::RootSummary,
  impl_ipc_request,
  ipc::{RequestData, ResponseData},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "params")]
pub enum RootsRequest {
  Add(RootAddParams),
  Remove(RootRemoveParams),
  List(RootListParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "data")]
pub enum RootsResponse {
  Add(RootAddResult),
  Remove(RootRemoveResult),
  List(RootListResult),
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootAddParams {
  pub path: String,
  #[serde(default = "default_true")]
  pub recurse: bool,
  #[serde(default)]
  pub exclude_globs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootRemoveParams {
  pub path: String,
  /// Also delete stored metadata for the subtree
  #[serde(default)]
  pub cascade: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RootListParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootAddResult {
  pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootRemoveResult {
  pub path: String,
  /// Queued items dropped with the root
  pub dropped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootInfo {
  pub path: String,
  pub recurse: bool,
  pub exclude_globs: Vec<String>,
}

impl From<RootSummary> for RootInfo {
  fn from(root: RootSummary) -> Self {
    Self {
      path: root.path.to_string_lossy().to_string(),
      recurse: root.recurse,
      exclude_globs: root.exclude_globs,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootListResult {
  pub roots: Vec<RootInfo>,
}

impl_ipc_request!(
  RootAddParams => RootAddResult,
  ResponseData::Roots(RootsResponse::Add(v)) => v,
  v => RequestData::Roots(RootsRequest::Add(v)),
  v => ResponseData::Roots(RootsResponse::Add(v))
);
impl_ipc_request!(
  RootRemoveParams => RootRemoveResult,
  ResponseData::Roots(RootsResponse::Remove(v)) => v,
  v => RequestData::Roots(RootsRequest::Remove(v)),
  v => ResponseData::Roots(RootsResponse::Remove(v))
);
impl_ipc_request!(
  RootListParams => RootListResult,
  ResponseData::Roots(RootsResponse::List(v)) => v,
  v => RequestData::Roots(RootsRequest::List(v)),
  v => ResponseData::Roots(RootsResponse::List(v))
);
