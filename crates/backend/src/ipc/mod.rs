//! IPC module - client/server communication and type definitions
use serde::{Deserialize, Serialize};

pub mod client;
pub mod relay;
pub mod types;

pub use client::{Client, IpcRequest};
pub use types::*;

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum IpcError {
  #[error("Ser/de error: {0}")]
  Serde(String),
  #[error("RPC error {code}: {message}")]
  Rpc { code: i32, message: String },
  #[error("No result in response")]
  NoResult,
  #[error("IO error: {0}")]
  Io(String),
  #[error("Server shutdown")]
  Shutdown,
  #[error("Connection error: {0}")]
  Connection(String),
  #[error("Codec error: {0}")]
  Codec(String),
}

impl From<serde_json::Error> for IpcError {
  fn from(err: serde_json::Error) -> Self {
    IpcError::Serde(err.to_string())
  }
}

impl From<std::io::Error> for IpcError {
  fn from(err: std::io::Error) -> Self {
    IpcError::Io(err.to_string())
  }
}

impl From<tokio_util::codec::LinesCodecError> for IpcError {
  fn from(err: tokio_util::codec::LinesCodecError) -> Self {
    IpcError::Codec(err.to_string())
  }
}

// ============================================================================
// Request/Response envelopes (top-level IPC protocol)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
  pub id: String,
  #[serde(flatten)]
  pub data: RequestData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method", content = "params")]
pub enum RequestData {
  Index(index::IndexRequest),
  Roots(roots::RootsRequest),
  System(system::SystemRequest),
}

impl RequestData {
  /// Short label for request logs, e.g. `roots.add`
  pub fn describe(&self) -> String {
    let (method, params) = match self {
      RequestData::Index(r) => ("index", serde_json::to_value(r)),
      RequestData::Roots(r) => ("roots", serde_json::to_value(r)),
      RequestData::System(r) => ("system", serde_json::to_value(r)),
    };
    let action = params
      .ok()
      .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(str::to_string))
      .unwrap_or_default();
    format!("{method}.{action}")
  }
}

// ============================================================================
// Response envelope
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
  pub id: String,
  #[serde(flatten)]
  pub scenario: ResponseScenario,
}

impl Response {
  pub fn is_error(&self) -> bool {
    matches!(self.scenario, ResponseScenario::Error { .. })
  }

  pub fn is_success(&self) -> bool {
    matches!(self.scenario, ResponseScenario::Result { .. })
  }

  pub fn get_data(&self) -> Option<&ResponseData> {
    match &self.scenario {
      ResponseScenario::Result { data } => Some(data),
      _ => None,
    }
  }

  pub fn get_error(&self) -> Option<&IpcError> {
    match &self.scenario {
      ResponseScenario::Error { error } => Some(error),
      _ => None,
    }
  }

  /// Create a success response with typed data
  pub fn success(id: impl Into<String>, data: ResponseData) -> Self {
    Self {
      id: id.into(),
      scenario: ResponseScenario::Result { data },
    }
  }

  /// Create an error response
  pub fn error(id: impl Into<String>, error: IpcError) -> Self {
    Self {
      id: id.into(),
      scenario: ResponseScenario::Error { error },
    }
  }

  /// Create an RPC error response with code and message
  pub fn rpc_error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
    Self::error(
      id,
      IpcError::Rpc {
        code,
        message: message.into(),
      },
    )
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseScenario {
  Error {
    error: IpcError,
  },
  Result {
    #[serde(flatten)]
    data: ResponseData,
  },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method", content = "params")]
pub enum ResponseData {
  Index(index::IndexResponse),
  Roots(roots::RootsResponse),
  System(system::SystemResponse),
}
