//! Index IPC types - on-demand indexing requests
use serde::{Deserialize, Serialize};

use crate::{
  impl_ipc_request,
  ipc::{RequestData, ResponseData},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "params")]
pub enum IndexRequest {
  ReindexContentTypes(ReindexParams),
  IndexFile(IndexFileParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "data")]
pub enum IndexResponse {
  ReindexContentTypes(ReindexResult),
  IndexFile(IndexFileResult),
}

/// Re-index every stored file whose content type matches one of `types`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexParams {
  pub types: Vec<String>,
}

/// Index one file now. `uri` may be a `file://` URI or an absolute path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFileParams {
  pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexResult {
  pub queued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFileResult {
  pub uri: String,
}

impl_ipc_request!(
  ReindexParams => ReindexResult,
  ResponseData::Index(IndexResponse::ReindexContentTypes(v)) => v,
  v => RequestData::Index(IndexRequest::ReindexContentTypes(v)),
  v => ResponseData::Index(IndexResponse::ReindexContentTypes(v))
);
impl_ipc_request!(
  IndexFileParams => IndexFileResult,
  ResponseData::Index(IndexResponse::IndexFile(v)) => v,
  v => RequestData::Index(IndexRequest::IndexFile(v)),
  v => ResponseData::Index(IndexResponse::IndexFile(v))
);
