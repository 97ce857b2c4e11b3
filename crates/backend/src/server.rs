//! IPC server - newline-delimited JSON over a Unix socket.
//!
//! The server accepts connections and hands each parsed request to the
//! [`Control`] surface. Each connection gets a caller identity: the peer's
//! PID from the socket credentials when available, otherwise a per-connection
//! id.
//!
//! # Protocol
//!
//! - Requests: `{"id", "method", "params"}`, one per line
//! - Responses: `{"id", ...result}` or `{"id", "error"}`, one per line
//! - Requests on one connection are answered in order

use std::{
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
};

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::{
  codec::{Framed, LinesCodec},
  sync::CancellationToken,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
  actor::CallerId,
  control::Control,
  ipc::{IpcError, Request, Response},
};

// ============================================================================
// Server Configuration
// ============================================================================

pub struct ServerConfig {
  /// Path to the Unix socket for IPC
  pub socket_path: PathBuf,

  /// Executes the requests
  pub control: Arc<Control>,
}

// ============================================================================
// Server
// ============================================================================

/// Accepts connections and spawns a task for each one.
///
/// # Lifecycle
///
/// 1. `Server::new()` creates the server with all dependencies
/// 2. `Server::run()` binds the socket and accepts connections
/// 3. Each connection spawns a `handle_connection` task
/// 4. On cancellation, the socket file is removed
pub struct Server {
  config: ServerConfig,
  connections: AtomicU64,
}

impl Server {
  pub fn new(config: ServerConfig) -> Self {
    Self {
      config,
      connections: AtomicU64::new(0),
    }
  }

  /// Run the server until the cancellation token is triggered.
  pub async fn run(&self, cancel: CancellationToken) -> Result<(), IpcError> {
    // Remove stale socket file
    if self.config.socket_path.exists() {
      tokio::fs::remove_file(&self.config.socket_path).await?;
    }

    if let Some(parent) = self.config.socket_path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(&self.config.socket_path)?;
    info!(socket = %self.config.socket_path.display(), "Server listening");

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!("Server shutting down (cancelled)");
          break;
        }

        result = listener.accept() => {
          match result {
            Ok((stream, _)) => {
              let connection = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
              let control = Arc::clone(&self.config.control);
              tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, control, connection).await {
                  debug!(connection, error = %e, "Connection ended with error");
                }
              });
            }
            Err(e) => {
              error!(error = %e, "Accept error");
            }
          }
        }
      }
    }

    if self.config.socket_path.exists() {
      tokio::fs::remove_file(&self.config.socket_path).await?;
    }

    Ok(())
  }
}

// ============================================================================
// Connection Handler
// ============================================================================

fn caller_for(stream: &UnixStream, connection: u64) -> CallerId {
  match stream.peer_cred().ok().and_then(|cred| cred.pid()) {
    Some(pid) if pid > 0 => CallerId::for_pid(pid as u32),
    _ => CallerId::for_connection(connection),
  }
}

/// Serve one client connection.
///
/// Parse errors get an error response but don't close the connection; IO
/// errors do.
async fn handle_connection(stream: UnixStream, control: Arc<Control>, connection: u64) -> Result<(), IpcError> {
  let caller = caller_for(&stream, connection);
  debug!(caller = %caller, "Client connected");

  let framed = Framed::new(stream, LinesCodec::new());
  let (mut sink, mut stream) = framed.split();
  let mut request_count = 0u64;

  while let Some(result) = stream.next().await {
    let line = match result {
      Ok(l) => l,
      Err(e) => {
        warn!(error = %e, "Error reading from client");
        break;
      }
    };

    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }
    request_count += 1;

    let request: Request = match serde_json::from_str(trimmed) {
      Ok(r) => r,
      Err(e) => {
        warn!(error = %e, "Invalid request JSON");
        let response = Response::rpc_error("unknown", -32700, format!("Parse error: {e}"));
        sink.send(serde_json::to_string(&response)?).await?;
        continue;
      }
    };

    trace!(id = %request.id, caller = %caller, "Processing request");
    let response = match control.handle(&caller, request.data).await {
      Ok(data) => Response::success(&request.id, data),
      Err(e) => Response::rpc_error(&request.id, e.code(), e.to_string()),
    };
    sink.send(serde_json::to_string(&response)?).await?;
  }

  debug!(caller = %caller, requests_handled = request_count, "Client disconnected");
  Ok(())
}

// ============================================================================
// Tests
// ============================================================================
