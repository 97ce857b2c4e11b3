//! Dispatcher concurrency bounds under load.

#[cfg(test)]
mod tests {
  use std::{
    path::PathBuf,
    sync::{Arc, atomic::Ordering},
    time::Duration,
  };

  use tokio_util::sync::CancellationToken;

  use crate::{
    actor::{
      __tests__::helpers::{RecordingBackend, registry_with},
      dispatcher::{DispatchOutcome, DispatcherConfig, ExtractionDispatcher},
    },
    extract::ConcurrencyModel,
  };

  fn dispatcher(backend: Arc<RecordingBackend>, pool_size: usize) -> ExtractionDispatcher {
    ExtractionDispatcher::new(
      registry_with("recorder", &["text/*"], backend),
      DispatcherConfig {
        pool_size,
        timeout: Duration::from_secs(30),
      },
      CancellationToken::new(),
    )
  }

  #[tokio::test(start_paused = true)]
  async fn test_worker_pool_never_exceeds_pool_size() {
    let backend = RecordingBackend::new("recorder").with_delay(Duration::from_millis(20));
    let dispatcher = dispatcher(backend.clone(), 3);

    let paths: Vec<PathBuf> = (0..10).map(|i| PathBuf::from(format!("/docs/{i}.txt"))).collect();
    let outcomes = futures::future::join_all(paths.iter().map(|p| dispatcher.dispatch(p, "text/plain"))).await;

    assert!(outcomes.iter().all(|o| matches!(o, DispatchOutcome::Extracted { .. })));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 10, "every item ran exactly once");
    assert_eq!(backend.gauge().peak(), 3);
    assert_eq!(backend.gauge().current(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_same_path_never_overlaps() {
    for model in [ConcurrencyModel::None, ConcurrencyModel::WorkerPool] {
      let backend = RecordingBackend::new("recorder")
        .with_delay(Duration::from_millis(20))
        .with_concurrency(model);
      let dispatcher = dispatcher(backend.clone(), 4);

      let path = PathBuf::from("/docs/same.txt");
      let other = PathBuf::from("/docs/other.txt");
      let runs = (0..4).map(|i| dispatcher.dispatch(if i == 3 { &other } else { &path }, "text/plain"));
      futures::future::join_all(runs).await;

      assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
      assert_eq!(backend.per_path_peak(), 1, "{model}: one path, one execution at a time");
      assert_eq!(backend.gauge().peak(), 2, "{model}: different paths still overlap");
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_dispatcher_fails_items() {
    let backend = RecordingBackend::new("recorder")
      .with_delay(Duration::from_secs(10))
      .with_concurrency(ConcurrencyModel::SingleWorker);
    let cancel = CancellationToken::new();
    let dispatcher = ExtractionDispatcher::new(
      registry_with("recorder", &["text/*"], backend),
      DispatcherConfig {
        pool_size: 1,
        timeout: Duration::from_secs(30),
      },
      cancel.clone(),
    );

    let path = PathBuf::from("/docs/a.txt");
    let run = dispatcher.dispatch(&path, "text/plain");
    let stop = async {
      tokio::time::sleep(Duration::from_millis(5)).await;
      cancel.cancel();
    };
    let (outcome, ()) = tokio::join!(run, stop);
    assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
  }
}
