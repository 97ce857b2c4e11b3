//! Test helpers for actor integration tests.
//!
//! Provides instrumented extraction backends and a [`PipelineFixture`] that
//! runs a full pipeline against a temporary directory and an in-memory store.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{
  actor::{
    dispatcher::BackendRegistry,
    lifecycle::{CallerId, ClientIdentity, IdentityError, IdentityResolver},
    pipeline::{LogWriteback, Pipeline, PipelineConfig},
    scheduler::SchedulerConfig,
  },
  domain::{config::RootConfig, content},
  extract::{ConcurrencyModel, ExtractError, ExtractRequest, ExtractionBackend},
  store::{MemoryStore, Statement, Store, predicate},
};

// ============================================================================
// Concurrency gauge
// ============================================================================

/// Counts concurrent holders and remembers the high-water mark
#[derive(Debug, Default)]
pub struct Gauge {
  current: AtomicUsize,
  peak: AtomicUsize,
}

pub struct GaugeGuard<'a>(&'a Gauge);

impl Gauge {
  pub fn enter(&self) -> GaugeGuard<'_> {
    let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    GaugeGuard(self)
  }

  pub fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }

  pub fn current(&self) -> usize {
    self.current.load(Ordering::SeqCst)
  }
}

impl Drop for GaugeGuard<'_> {
  fn drop(&mut self) {
    self.0.current.fetch_sub(1, Ordering::SeqCst);
  }
}

// ============================================================================
// Recording backend
// ============================================================================

/// Backend that sleeps, counts its calls and records overlap
pub struct RecordingBackend {
  name: String,
  delay: Duration,
  concurrency: ConcurrencyModel,
  pub calls: AtomicUsize,
  gauge: Gauge,
  /// Overlap across several backends
  shared: Option<Arc<Gauge>>,
  /// Overlap per path
  per_path: Mutex<HashMap<PathBuf, Arc<Gauge>>>,
  seen: Mutex<Vec<PathBuf>>,
}

impl RecordingBackend {
  pub fn new(name: &str) -> Arc<Self> {
    Arc::new(Self::build(name.to_string(), Duration::ZERO, ConcurrencyModel::WorkerPool, None))
  }

  fn build(name: String, delay: Duration, concurrency: ConcurrencyModel, shared: Option<Arc<Gauge>>) -> Self {
    Self {
      name,
      delay,
      concurrency,
      calls: AtomicUsize::new(0),
      gauge: Gauge::default(),
      shared,
      per_path: Mutex::new(HashMap::new()),
      seen: Mutex::new(Vec::new()),
    }
  }

  pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
    Arc::new(Self::build(self.name.clone(), delay, self.concurrency, self.shared.clone()))
  }

  pub fn with_shared_gauge(self: Arc<Self>, shared: Arc<Gauge>) -> Arc<Self> {
    Arc::new(Self::build(self.name.clone(), self.delay, self.concurrency, Some(shared)))
  }

  pub fn with_concurrency(self: Arc<Self>, concurrency: ConcurrencyModel) -> Arc<Self> {
    Arc::new(Self::build(self.name.clone(), self.delay, concurrency, self.shared.clone()))
  }

  pub fn gauge(&self) -> &Gauge {
    &self.gauge
  }

  /// Highest overlap seen on any single path
  pub fn per_path_peak(&self) -> usize {
    self.per_path.lock().values().map(|g| g.peak()).max().unwrap_or(0)
  }

  /// Paths in the order extraction started
  pub fn seen(&self) -> Vec<PathBuf> {
    self.seen.lock().clone()
  }
}

#[async_trait]
impl ExtractionBackend for RecordingBackend {
  fn name(&self) -> &str {
    &self.name
  }

  fn default_concurrency(&self) -> ConcurrencyModel {
    self.concurrency
  }

  async fn extract(&self, request: ExtractRequest) -> Result<Vec<Statement>, ExtractError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.seen.lock().push(request.path.clone());
    let path_gauge = Arc::clone(self.per_path.lock().entry(request.path.clone()).or_default());

    let _own = self.gauge.enter();
    let _shared = self.shared.as_ref().map(|g| g.enter());
    let _path = path_gauge.enter();

    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }

    Ok(vec![Statement::new(predicate::TITLE, &self.name)])
  }
}

/// Backend that panics on any file whose name starts with `poison`
pub struct PanickingBackend {
  concurrency: ConcurrencyModel,
  pub calls: AtomicUsize,
}

impl PanickingBackend {
  pub fn new(concurrency: ConcurrencyModel) -> Arc<Self> {
    Arc::new(Self {
      concurrency,
      calls: AtomicUsize::new(0),
    })
  }
}

#[async_trait]
impl ExtractionBackend for PanickingBackend {
  fn name(&self) -> &str {
    "panicky"
  }

  fn default_concurrency(&self) -> ConcurrencyModel {
    self.concurrency
  }

  async fn extract(&self, request: ExtractRequest) -> Result<Vec<Statement>, ExtractError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let poisoned = request
      .path
      .file_name()
      .is_some_and(|name| name.to_string_lossy().starts_with("poison"));
    if poisoned {
      panic!("cannot parse {}", request.path.display());
    }
    Ok(vec![Statement::new(predicate::TITLE, "panicky")])
  }
}

// ============================================================================
// Identity resolvers
// ============================================================================

/// Resolver that answers from a fixed binary name and counts lookups
#[derive(Debug, Default)]
pub struct CountingResolver {
  pub lookups: AtomicUsize,
  pub fail: bool,
}

#[async_trait]
impl IdentityResolver for CountingResolver {
  async fn resolve(&self, caller: &CallerId) -> Result<ClientIdentity, IdentityError> {
    self.lookups.fetch_add(1, Ordering::SeqCst);
    if self.fail {
      return Err(IdentityError::NoPid(caller.clone()));
    }
    Ok(ClientIdentity {
      pid: caller.pid(),
      binary: Some("test-client".to_string()),
    })
  }
}

// ============================================================================
// Pipeline fixture
// ============================================================================

pub struct PipelineFixture {
  pub root: TempDir,
  pub store: Arc<MemoryStore>,
  pub pipeline: Arc<Pipeline>,
  pub cancel: CancellationToken,
}

impl PipelineFixture {
  /// A pipeline with `registry` over an empty temporary root. The watcher is
  /// off so tests drive events through the scheduler directly.
  pub fn new(registry: BackendRegistry, max_in_flight: usize) -> Self {
    let root = TempDir::new().expect("create root temp dir");
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();

    let config = PipelineConfig {
      scheduler: SchedulerConfig::default(),
      max_in_flight,
      watch: false,
      ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(
      Arc::clone(&store) as Arc<dyn Store>,
      registry,
      Arc::new(CountingResolver::default()),
      Arc::new(LogWriteback),
      config,
      cancel.clone(),
    );

    Self {
      root,
      store,
      pipeline,
      cancel,
    }
  }

  pub fn root_path(&self) -> PathBuf {
    self.root.path().to_path_buf()
  }

  pub fn path(&self, relative: &str) -> PathBuf {
    self.root.path().join(relative)
  }

  pub fn root_uri(&self) -> String {
    content::path_to_uri(self.root.path()).expect("absolute path has a URI")
  }

  pub fn uri(&self, relative: &str) -> String {
    content::path_to_uri(&self.path(relative)).expect("absolute path has a URI")
  }

  pub async fn write_file(&self, relative: &str, contents: &str) -> PathBuf {
    let path = self.path(relative);
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await.expect("create parent dirs");
    }
    tokio::fs::write(&path, contents).await.expect("write file");
    path
  }

  pub fn root_config(&self) -> RootConfig {
    RootConfig {
      path: self.root_path(),
      recurse: true,
      exclude_globs: Vec::new(),
      exclude_mime: Vec::new(),
    }
  }

  /// Start the pipeline with the temporary directory as its only root
  pub async fn start(&self) {
    self
      .pipeline
      .start(&[self.root_config()])
      .await
      .expect("pipeline should start");
  }

  /// Wait for the pipeline to go idle, failing the test after `timeout`
  pub async fn settle(&self, timeout: Duration) {
    tokio::time::timeout(timeout, self.pipeline.wait_idle())
      .await
      .expect("pipeline did not go idle in time");
  }
}

impl Drop for PipelineFixture {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

/// Registry with a single backend under `patterns`
pub fn registry_with(name: &str, patterns: &[&str], backend: Arc<RecordingBackend>) -> BackendRegistry {
  let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
  let mut registry = BackendRegistry::new();
  registry
    .register(name, &patterns, None, backend)
    .expect("register test backend");
  registry
}

/// Whether `path` has been indexed by `store`
pub fn is_indexed(store: &MemoryStore, path: &Path) -> bool {
  content::path_to_uri(path).is_some_and(|uri| store.contains(&uri))
}
