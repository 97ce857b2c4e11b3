//! Request tracking per IPC caller
//!
//! Every control call is bracketed by [`RequestTracker::begin_request`] and
//! [`RequestTracker::end_request`]. The tracker keeps one [`ClientRecord`]
//! per caller while it has requests in flight, and for a grace period
//! afterwards so a chatty client is resolved only once.
//!
//! When a client's active count drops to zero a one-shot cleanup timer is
//! armed. A new request from the same caller before it fires cancels it and
//! reuses the record; otherwise the record is evicted.

use std::{
  collections::{HashMap, hash_map::Entry},
  fmt,
  sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Opaque caller identifier, e.g. `pid:4242` or `conn:7`
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct CallerId(pub String);

impl CallerId {
  pub fn for_pid(pid: u32) -> Self {
    Self(format!("pid:{pid}"))
  }

  pub fn for_connection(id: u64) -> Self {
    Self(format!("conn:{id}"))
  }

  /// The process id encoded in the identifier, if any
  pub fn pid(&self) -> Option<u32> {
    self.0.strip_prefix("pid:")?.parse().ok()
  }
}

impl fmt::Display for CallerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<String> for CallerId {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl From<&str> for CallerId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

// ============================================================================
// Identity resolution
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
  pub pid: Option<u32>,
  pub binary: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
  #[error("Caller {0} carries no process id")]
  NoPid(CallerId),

  #[error("Failed to read process name for pid {pid}: {source}")]
  Io {
    pid: u32,
    #[source]
    source: std::io::Error,
  },
}

/// Maps a caller identifier to the process behind it
#[async_trait]
pub trait IdentityResolver: Send + Sync {
  async fn resolve(&self, caller: &CallerId) -> Result<ClientIdentity, IdentityError>;
}

/// Reads the binary name from `/proc/<pid>/comm`
#[derive(Debug, Default)]
pub struct ProcIdentityResolver;

#[async_trait]
impl IdentityResolver for ProcIdentityResolver {
  async fn resolve(&self, caller: &CallerId) -> Result<ClientIdentity, IdentityError> {
    let pid = caller.pid().ok_or_else(|| IdentityError::NoPid(caller.clone()))?;
    let comm = tokio::fs::read_to_string(format!("/proc/{pid}/comm"))
      .await
      .map_err(|source| IdentityError::Io { pid, source })?;
    Ok(ClientIdentity {
      pid: Some(pid),
      binary: Some(comm.trim().to_string()),
    })
  }
}

// ============================================================================
// Records and handles
// ============================================================================

/// Who a caller is. Shared with in-flight handles through a weak reference.
#[derive(Debug)]
pub struct ClientRecord {
  pub caller: CallerId,
  pub pid: Option<u32>,
  pub binary: Option<String>,
}

#[derive(Debug)]
struct ClientState {
  record: Arc<ClientRecord>,
  active: usize,
  idle_since: Option<Instant>,
  cleanup: Option<CancellationToken>,
}

/// Point-in-time view of a tracked client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
  pub caller: CallerId,
  pub pid: Option<u32>,
  pub binary: Option<String>,
  pub active_requests: usize,
  pub idle: bool,
}

/// One in-flight request. Consumed by `end_request`.
#[derive(Debug)]
pub struct RequestHandle {
  pub id: u64,
  caller: CallerId,
  client: Weak<ClientRecord>,
  description: String,
  started: Instant,
}

impl RequestHandle {
  pub fn caller(&self) -> &CallerId {
    &self.caller
  }

  /// The client record, unless it has been evicted meanwhile
  pub fn client(&self) -> Option<Arc<ClientRecord>> {
    self.client.upgrade()
  }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
  pub lookup_enabled: bool,
  pub cleanup_delay: Duration,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      lookup_enabled: true,
      cleanup_delay: Duration::from_secs(300),
    }
  }
}

impl From<&crate::domain::config::TrackerConfig> for TrackerConfig {
  fn from(config: &crate::domain::config::TrackerConfig) -> Self {
    Self {
      lookup_enabled: config.client_lookup,
      cleanup_delay: config.cleanup_delay(),
    }
  }
}

// ============================================================================
// RequestTracker
// ============================================================================

/// Count one more request on an existing client, cancelling its cleanup
fn reuse(caller: &CallerId, state: &mut ClientState) -> Arc<ClientRecord> {
  if let Some(cleanup) = state.cleanup.take() {
    cleanup.cancel();
    trace!(caller = %caller, "Client cleanup cancelled");
  }
  state.active += 1;
  state.idle_since = None;
  Arc::clone(&state.record)
}

pub struct RequestTracker {
  clients: Arc<Mutex<HashMap<CallerId, ClientState>>>,
  resolver: Arc<dyn IdentityResolver>,
  lookup_enabled: AtomicBool,
  next_id: AtomicU64,
  cleanup_delay: Duration,
  cancel: CancellationToken,
}

impl RequestTracker {
  pub fn new(resolver: Arc<dyn IdentityResolver>, config: TrackerConfig, cancel: CancellationToken) -> Self {
    Self {
      clients: Arc::new(Mutex::new(HashMap::new())),
      resolver,
      lookup_enabled: AtomicBool::new(config.lookup_enabled),
      next_id: AtomicU64::new(1),
      cleanup_delay: config.cleanup_delay,
      cancel,
    }
  }

  /// Start tracking a request from `caller`.
  pub async fn begin_request(&self, caller: &CallerId, description: impl Into<String>) -> RequestHandle {
    let description = description.into();
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);

    let client = if self.lookup_enabled.load(Ordering::SeqCst) {
      let record = self.acquire(caller).await;
      debug!(
        request_id = id,
        caller = %caller,
        pid = record.pid,
        binary = record.binary.as_deref().unwrap_or("-"),
        description = %description,
        "Request started"
      );
      Arc::downgrade(&record)
    } else {
      debug!(request_id = id, caller = %caller, description = %description, "Request started");
      Weak::new()
    };

    RequestHandle {
      id,
      caller: caller.clone(),
      client,
      description,
      started: Instant::now(),
    }
  }

  /// Reuse or create the record for `caller` and count one more active request
  async fn acquire(&self, caller: &CallerId) -> Arc<ClientRecord> {
    if let Some(record) = self.try_reuse(caller) {
      return record;
    }

    // Resolve without holding the registry lock
    let identity = match self.resolver.resolve(caller).await {
      Ok(identity) => identity,
      Err(e) => {
        debug!(caller = %caller, error = %e, "Caller identity unavailable");
        ClientIdentity {
          pid: caller.pid(),
          binary: None,
        }
      }
    };

    // Another request may have created the record while we were resolving
    let mut clients = self.clients.lock();
    match clients.entry(caller.clone()) {
      Entry::Occupied(mut entry) => reuse(caller, entry.get_mut()),
      Entry::Vacant(entry) => {
        let record = Arc::new(ClientRecord {
          caller: caller.clone(),
          pid: identity.pid,
          binary: identity.binary,
        });
        entry.insert(ClientState {
          record: Arc::clone(&record),
          active: 1,
          idle_since: None,
          cleanup: None,
        });
        trace!(caller = %caller, "Client registered");
        record
      }
    }
  }

  fn try_reuse(&self, caller: &CallerId) -> Option<Arc<ClientRecord>> {
    let mut clients = self.clients.lock();
    clients.get_mut(caller).map(|state| reuse(caller, state))
  }

  /// Finish a request, logging its outcome.
  pub fn end_request(&self, handle: RequestHandle, error: Option<&dyn fmt::Display>) {
    let elapsed_ms = handle.started.elapsed().as_millis() as u64;
    let client = handle.client.upgrade();
    let binary = client.as_ref().and_then(|c| c.binary.as_deref()).unwrap_or("-");
    let pid = client.as_ref().and_then(|c| c.pid);

    match error {
      None => info!(
        request_id = handle.id,
        caller = %handle.caller,
        pid,
        binary,
        description = %handle.description,
        elapsed_ms,
        "Request finished"
      ),
      Some(error) => warn!(
        request_id = handle.id,
        caller = %handle.caller,
        pid,
        binary,
        description = %handle.description,
        elapsed_ms,
        error = %error,
        "Request failed"
      ),
    }

    // Evicted meanwhile, or tracked without lookup
    if client.is_none() {
      return;
    }
    self.release(&handle.caller);
  }

  fn release(&self, caller: &CallerId) {
    let mut clients = self.clients.lock();
    let Some(state) = clients.get_mut(caller) else {
      return;
    };

    state.active = state.active.saturating_sub(1);
    if state.active > 0 {
      return;
    }

    state.idle_since = Some(Instant::now());
    let token = self.cancel.child_token();
    state.cleanup = Some(token.clone());

    let registry = Arc::clone(&self.clients);
    let caller = caller.clone();
    let delay = self.cleanup_delay;
    tokio::spawn(async move {
      tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(delay) => {
          let mut clients = registry.lock();
          // A request that arrived in the meantime cancels the token under this lock
          let idle = clients
            .get(&caller)
            .is_some_and(|s| s.active == 0 && !token.is_cancelled());
          if idle {
            clients.remove(&caller);
            debug!(caller = %caller, "Idle client evicted");
          }
        }
      }
    });
  }

  /// Turn caller-identity tracking on or off. Turning it off forgets every client.
  pub fn set_lookup_enabled(&self, enabled: bool) {
    let was = self.lookup_enabled.swap(enabled, Ordering::SeqCst);
    if was == enabled {
      return;
    }

    if !enabled {
      let mut clients = self.clients.lock();
      for state in clients.values() {
        if let Some(cleanup) = &state.cleanup {
          cleanup.cancel();
        }
      }
      let evicted = clients.len();
      clients.clear();
      info!(evicted, "Client lookup disabled");
    } else {
      info!("Client lookup enabled");
    }
  }

  pub fn lookup_enabled(&self) -> bool {
    self.lookup_enabled.load(Ordering::SeqCst)
  }

  pub fn client_count(&self) -> usize {
    self.clients.lock().len()
  }

  pub fn client(&self, caller: &CallerId) -> Option<ClientSummary> {
    let clients = self.clients.lock();
    clients.get(caller).map(|state| ClientSummary {
      caller: state.record.caller.clone(),
      pid: state.record.pid,
      binary: state.record.binary.clone(),
      active_requests: state.active,
      idle: state.idle_since.is_some(),
    })
  }

  /// Cancel every pending cleanup timer
  pub fn shutdown(&self) {
    self.cancel.cancel();
  }
}
