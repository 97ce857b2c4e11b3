//! End-to-end pipeline runs against a temporary root and an in-memory store.

#[cfg(test)]
mod tests {
  use std::{sync::atomic::Ordering, time::Duration};

  use pretty_assertions::assert_eq;

  use crate::{
    actor::{
      __tests__::helpers::{PanickingBackend, PipelineFixture, RecordingBackend, is_indexed, registry_with},
      dispatcher::BackendRegistry,
      message::{FsEvent, FsEventKind},
      pipeline::PipelineError,
      scheduler::SchedulerState,
    },
    extract::ConcurrencyModel,
    store::predicate,
  };

  const SETTLE: Duration = Duration::from_secs(10);

  async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + SETTLE;
    while !done() {
      assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  }

  #[tokio::test]
  async fn test_initial_crawl_indexes_everything() {
    let backend = RecordingBackend::new("text");
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], backend.clone()), 4);
    let a = fixture.write_file("a.txt", "alpha").await;
    let b = fixture.write_file("sub/b.txt", "beta").await;
    fixture.write_file("sub/c.bin", "\u{0}\u{1}").await;

    fixture.start().await;
    fixture.settle(SETTLE).await;

    assert!(is_indexed(&fixture.store, &a));
    assert!(is_indexed(&fixture.store, &b));
    assert_eq!(
      fixture.store.object(&fixture.uri("a.txt"), predicate::MIME_TYPE).as_deref(),
      Some("text/plain")
    );
    assert_eq!(
      fixture.store.object(&fixture.uri("a.txt"), predicate::TITLE).as_deref(),
      Some("text"),
      "extracted facts are stored with the file facts"
    );
    assert_eq!(
      fixture.store.object(&fixture.uri("sub/b.txt"), predicate::CONTAINER),
      Some(fixture.uri("sub"))
    );

    // The directory and the binary file have no backend but are still recorded
    assert!(fixture.store.contains(&fixture.uri("sub")));
    assert!(fixture.store.contains(&fixture.uri("sub/c.bin")));

    let stats = fixture.pipeline.stats();
    assert_eq!(stats.indexed, 2);
    assert_eq!(stats.no_backend, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.pipeline.status().state, SchedulerState::Idle);
  }

  #[tokio::test]
  async fn test_recrawl_skips_unchanged_files() {
    let backend = RecordingBackend::new("text");
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], backend.clone()), 2);
    fixture.write_file("a.txt", "alpha").await;

    fixture.start().await;
    fixture.settle(SETTLE).await;
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

    fixture
      .pipeline
      .index_file(fixture.root_path().to_str().unwrap())
      .await
      .unwrap();
    fixture.settle(SETTLE).await;
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1, "mtime unchanged, nothing re-extracted");
  }

  #[tokio::test]
  async fn test_removal_and_move_events() {
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], RecordingBackend::new("text")), 2);
    let gone = fixture.write_file("gone.txt", "bye").await;
    let old = fixture.write_file("old.txt", "moving").await;

    fixture.start().await;
    fixture.settle(SETTLE).await;
    assert!(is_indexed(&fixture.store, &gone));

    tokio::fs::remove_file(&gone).await.unwrap();
    let new = fixture.path("new.txt");
    tokio::fs::rename(&old, &new).await.unwrap();

    let scheduler = fixture.pipeline.scheduler();
    scheduler.handle_event(FsEvent::new(gone.clone(), FsEventKind::Removed));
    scheduler.handle_event(FsEvent::new(old.clone(), FsEventKind::Moved { to: new.clone() }));
    fixture.settle(SETTLE).await;

    assert!(!is_indexed(&fixture.store, &gone));
    assert!(!is_indexed(&fixture.store, &old));
    assert!(is_indexed(&fixture.store, &new));
    assert_eq!(
      fixture.store.object(&fixture.uri("new.txt"), predicate::URL),
      Some(fixture.uri("new.txt"))
    );

    let stats = fixture.pipeline.stats();
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.moved, 1);
  }

  #[tokio::test]
  async fn test_repeated_checks_never_overlap_one_path() {
    let backend = RecordingBackend::new("text").with_delay(Duration::from_millis(30));
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], backend.clone()), 4);
    let a = fixture.write_file("a.txt", "alpha").await;

    fixture.start().await;
    for _ in 0..5 {
      fixture
        .pipeline
        .scheduler()
        .check_file(&a, 0, false)
        .await
        .unwrap();
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    fixture.settle(SETTLE).await;

    assert!(backend.calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(backend.per_path_peak(), 1);
  }

  #[tokio::test]
  async fn test_root_removed_during_extraction_discards_result() {
    let backend = RecordingBackend::new("text").with_delay(Duration::from_millis(300));
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], backend.clone()), 1);
    let a = fixture.write_file("a.txt", "alpha").await;

    fixture.start().await;
    wait_until(|| backend.calls.load(Ordering::SeqCst) > 0).await;
    fixture
      .pipeline
      .remove_directory(&fixture.root_path(), false)
      .await
      .unwrap();
    fixture.settle(SETTLE).await;

    assert!(!is_indexed(&fixture.store, &a));
    assert_eq!(fixture.pipeline.stats().discarded, 1);
    assert!(fixture.pipeline.roots().is_empty());
  }

  #[tokio::test]
  async fn test_reindex_by_content_type() {
    let backend = RecordingBackend::new("text");
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], backend.clone()), 2);
    fixture.write_file("a.txt", "alpha").await;
    fixture.write_file("b.md", "# beta").await;
    fixture.write_file("c.bin", "\u{0}").await;

    fixture.start().await;
    fixture.settle(SETTLE).await;
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

    let queued = fixture
      .pipeline
      .reindex_content_types(&["text/plain".to_string()])
      .await
      .unwrap();
    assert_eq!(queued, 1);
    fixture.settle(SETTLE).await;
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

    let err = fixture.pipeline.reindex_content_types(&["nonsense".to_string()]).await;
    assert!(err.is_err());
  }

  #[tokio::test]
  async fn test_pause_holds_work_until_resume() {
    let backend = RecordingBackend::new("text");
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], backend.clone()), 2);
    fixture.write_file("a.txt", "alpha").await;

    fixture.pipeline.pause();
    fixture.start().await;
    fixture.pipeline.scheduler().wait_for_crawls().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = fixture.pipeline.status();
    assert_eq!(status.state, SchedulerState::Paused);
    assert_eq!(status.queued, 1);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

    fixture.pipeline.resume();
    fixture.settle(SETTLE).await;
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_start_rejects_missing_root() {
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], RecordingBackend::new("text")), 1);
    let mut root = fixture.root_config();
    root.path = fixture.path("missing");

    assert!(fixture.pipeline.start(&[root]).await.is_err());
    assert!(fixture.pipeline.roots().is_empty());
    assert!(fixture.store.is_empty());
  }

  #[tokio::test]
  async fn test_writeback_is_processed_and_counted() {
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], RecordingBackend::new("text")), 2);
    let a = fixture.write_file("a.txt", "alpha").await;
    fixture.start().await;
    fixture.settle(SETTLE).await;

    fixture
      .pipeline
      .notify_writeback(&a, vec!["nfo:Document".to_string()], vec![vec!["title".to_string(), "Alpha".to_string()]])
      .unwrap();
    fixture.settle(SETTLE).await;
    assert_eq!(fixture.pipeline.stats().writebacks, 1);

    let outside = tempfile::NamedTempFile::new().unwrap();
    assert!(fixture.pipeline.notify_writeback(outside.path(), Vec::new(), Vec::new()).is_err());
  }

  #[tokio::test]
  async fn test_store_failure_counts_as_failed() {
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], RecordingBackend::new("text")), 2);
    let a = fixture.write_file("a.txt", "alpha").await;
    fixture.store.set_read_only(true);

    fixture.start().await;
    fixture.settle(SETTLE).await;

    assert!(!is_indexed(&fixture.store, &a));
    assert_eq!(fixture.pipeline.stats().failed, 1);
    assert_eq!(fixture.pipeline.stats().indexed, 0);
  }

  #[tokio::test]
  async fn test_cascade_removal_deletes_subtree() {
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], RecordingBackend::new("text")), 2);
    fixture.write_file("a.txt", "alpha").await;
    fixture.write_file("sub/b.txt", "beta").await;
    fixture.write_file("sub/deeper/c.txt", "gamma").await;
    fixture.start().await;
    fixture.settle(SETTLE).await;
    assert!(fixture.store.contains(&fixture.uri("sub/deeper/c.txt")));

    fixture.pipeline.remove_directory(&fixture.root_path(), true).await.unwrap();
    fixture.settle(SETTLE).await;

    assert!(fixture.pipeline.roots().is_empty());
    assert!(fixture.store.is_empty(), "left behind: {:?}", fixture.store.subjects());
  }

  #[tokio::test]
  async fn test_cascade_removal_spares_nested_root() {
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], RecordingBackend::new("text")), 2);
    fixture.write_file("a.txt", "alpha").await;
    fixture.write_file("sub/b.txt", "beta").await;
    fixture.write_file("sub/deeper/c.txt", "gamma").await;
    fixture.start().await;
    fixture.settle(SETTLE).await;

    fixture.pipeline.add_directory(fixture.path("sub"), true, &[]).await.unwrap();
    fixture.settle(SETTLE).await;

    // Dropping the nested root keeps everything: the outer root still covers it
    fixture.pipeline.remove_directory(&fixture.path("sub"), true).await.unwrap();
    fixture.settle(SETTLE).await;
    assert!(fixture.store.contains(&fixture.uri("sub")));
    assert!(fixture.store.contains(&fixture.uri("sub/b.txt")));

    fixture.pipeline.add_directory(fixture.path("sub"), true, &[]).await.unwrap();
    fixture.settle(SETTLE).await;
    fixture.pipeline.remove_directory(&fixture.root_path(), true).await.unwrap();
    fixture.settle(SETTLE).await;

    assert!(!fixture.store.contains(&fixture.uri("a.txt")));
    assert!(!fixture.store.contains(&fixture.root_uri()));
    assert!(fixture.store.contains(&fixture.uri("sub")));
    assert!(fixture.store.contains(&fixture.uri("sub/b.txt")));
    assert!(fixture.store.contains(&fixture.uri("sub/deeper/c.txt")));
    assert_eq!(fixture.pipeline.roots().len(), 1);
  }

  #[tokio::test]
  async fn test_panicking_backend_does_not_wedge_pipeline() {
    for model in [ConcurrencyModel::None, ConcurrencyModel::MainThread] {
      let backend = PanickingBackend::new(model);
      let mut registry = BackendRegistry::new();
      registry
        .register("panicky", &["text/*".to_string()], Some(model), backend.clone())
        .unwrap();
      let fixture = PipelineFixture::new(registry, 2);
      let poison = fixture.write_file("poison.txt", "boom").await;
      let fine = fixture.write_file("fine.txt", "calm").await;

      fixture.start().await;
      fixture.settle(SETTLE).await;

      let status = fixture.pipeline.status();
      assert_eq!(status.in_flight, 0, "{model}");
      assert_eq!(status.state, SchedulerState::Idle, "{model}");
      assert_eq!(fixture.pipeline.stats().failed, 1, "{model}");
      assert!(!is_indexed(&fixture.store, &poison), "{model}");
      assert!(is_indexed(&fixture.store, &fine), "{model}");

      // The path is free for an on-demand retry
      fixture.pipeline.index_file(&poison.to_string_lossy()).await.unwrap();
      fixture.settle(SETTLE).await;
      assert_eq!(fixture.pipeline.stats().failed, 2, "{model}");
      assert_eq!(backend.calls.load(Ordering::SeqCst), 3, "{model}");
    }
  }

  #[tokio::test]
  async fn test_second_start_is_rejected() {
    let fixture = PipelineFixture::new(registry_with("text", &["text/*"], RecordingBackend::new("text")), 2);
    fixture.write_file("a.txt", "alpha").await;
    fixture.start().await;
    fixture.settle(SETTLE).await;

    let err = fixture.pipeline.start(&[fixture.root_config()]).await.unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyStarted));
    assert_eq!(fixture.pipeline.roots().len(), 1);
    assert_eq!(fixture.pipeline.stats().indexed, 1);
  }
}
