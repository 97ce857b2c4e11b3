//! Backends that shell out to a helper program
//!
//! The helper gets the file path (substituted for a `{path}` argument, or
//! appended) and writes its result to stdout: either a JSON object mapping
//! predicates to values, or plain text stored as `nie:plainTextContent`.
//! Stdout is collected through the stream relay while the process runs.

use std::{path::PathBuf, process::Stdio, sync::OnceLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
  io::AsyncWriteExt,
  process::{Child, Command},
};
use tracing::debug;

use super::{ConcurrencyModel, ExtractError, ExtractRequest, ExtractionBackend};
use crate::{
  ipc::relay::{self, RelayError, RelayPeer},
  store::{Statement, predicate},
};

const PATH_PLACEHOLDER: &str = "{path}";

pub struct CommandBackend {
  name: String,
  program: String,
  args: Vec<String>,
  resolved: OnceLock<PathBuf>,
}

impl CommandBackend {
  pub fn new(name: impl Into<String>, command: &[String]) -> Result<Self, ExtractError> {
    let name = name.into();
    let Some((program, args)) = command.split_first() else {
      return Err(ExtractError::Unavailable(format!("{name}: empty command")));
    };
    Ok(Self {
      name,
      program: program.clone(),
      args: args.to_vec(),
      resolved: OnceLock::new(),
    })
  }

  fn args_for(&self, path: &std::path::Path) -> Vec<String> {
    let path = path.to_string_lossy();
    let mut substituted = false;
    let mut args: Vec<String> = self
      .args
      .iter()
      .map(|arg| {
        if arg == PATH_PLACEHOLDER {
          substituted = true;
          path.to_string()
        } else {
          arg.clone()
        }
      })
      .collect();
    if !substituted {
      args.push(path.to_string());
    }
    args
  }
}

/// The helper process as a relay peer: closing stdin is the request, the
/// exit status is the reply.
struct ChildPeer {
  program: String,
  child: Child,
}

#[async_trait]
impl RelayPeer for ChildPeer {
  async fn exchange(&mut self, message: Vec<u8>) -> Result<(), RelayError> {
    if let Some(mut stdin) = self.child.stdin.take()
      && !message.is_empty()
    {
      stdin
        .write_all(&message)
        .await
        .map_err(|e| RelayError::Transport(e.to_string()))?;
    }

    let status = self
      .child
      .wait()
      .await
      .map_err(|e| RelayError::Transport(e.to_string()))?;
    if status.success() {
      Ok(())
    } else {
      Err(RelayError::Peer(format!("{} exited with {status}", self.program)))
    }
  }
}

fn object_text(value: Value) -> String {
  match value {
    Value::String(s) => s,
    other => other.to_string(),
  }
}

fn parse_output(stdout: &[u8]) -> Vec<Statement> {
  if let Ok(map) = serde_json::from_slice::<serde_json::Map<String, Value>>(stdout) {
    return map
      .into_iter()
      .flat_map(|(predicate, value)| match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items
          .into_iter()
          .map(|item| Statement::new(predicate.clone(), object_text(item)))
          .collect(),
        other => vec![Statement::new(predicate, object_text(other))],
      })
      .collect();
  }

  let text = String::from_utf8_lossy(stdout);
  let text = text.trim();
  if text.is_empty() {
    Vec::new()
  } else {
    vec![Statement::new(predicate::PLAIN_TEXT, text)]
  }
}

#[async_trait]
impl ExtractionBackend for CommandBackend {
  fn name(&self) -> &str {
    &self.name
  }

  fn default_concurrency(&self) -> ConcurrencyModel {
    ConcurrencyModel::SingleWorker
  }

  fn init(&self) -> Result<(), ExtractError> {
    let resolved = which::which(&self.program)
      .map_err(|e| ExtractError::Unavailable(format!("{}: {e}", self.program)))?;
    debug!(backend = %self.name, program = %resolved.display(), "Resolved helper program");
    let _ = self.resolved.set(resolved);
    Ok(())
  }

  async fn extract(&self, request: ExtractRequest) -> Result<Vec<Statement>, ExtractError> {
    let program = self
      .resolved
      .get()
      .cloned()
      .unwrap_or_else(|| PathBuf::from(&self.program));

    let mut child = Command::new(&program)
      .args(self.args_for(&request.path))
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| ExtractError::Failed(format!("Failed to spawn {}: {e}", self.program)))?;

    let Some(stdout) = child.stdout.take() else {
      return Err(ExtractError::Failed("helper stdout was not captured".to_string()));
    };
    let peer = ChildPeer {
      program: self.program.clone(),
      child,
    };

    let output = relay::relay(peer, Vec::new(), stdout, request.cancel.clone(), None)
      .await
      .map_err(|e| match e {
        RelayError::Cancelled => ExtractError::Cancelled,
        RelayError::Peer(message) => ExtractError::Failed(message),
        other => ExtractError::Failed(other.to_string()),
      })?;

    Ok(parse_output(&output))
  }
}
