//! Scheduler ordering: crawl output, on-demand checks and throttling.

#[cfg(test)]
mod tests {
  use std::{path::PathBuf, sync::Arc, time::Duration};

  use parking_lot::RwLock;
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;
  use tokio::time::Instant;
  use tokio_util::sync::CancellationToken;

  use crate::{
    actor::{
      message::{WorkItem, WorkKind, priority},
      scheduler::{CrawlScheduler, SchedulerConfig},
    },
    domain::tree::{IndexingTree, RootFilter},
    store::MemoryStore,
  };

  fn scheduler(config: SchedulerConfig) -> Arc<CrawlScheduler> {
    CrawlScheduler::new(
      Arc::new(RwLock::new(IndexingTree::new())),
      Arc::new(MemoryStore::new()),
      config,
      CancellationToken::new(),
    )
  }

  async fn drain(scheduler: &CrawlScheduler, count: usize) -> Vec<(PathBuf, i32)> {
    let mut order = Vec::with_capacity(count);
    for _ in 0..count {
      let item = scheduler.next_item().await;
      scheduler.complete(&item);
      order.push((item.target, item.priority));
    }
    order
  }

  #[tokio::test]
  async fn test_checked_file_overtakes_crawl() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.jpg");
    tokio::fs::write(&a, "alpha").await.unwrap();
    tokio::fs::write(&b, [0xFF, 0xD8, 0xFF]).await.unwrap();

    let scheduler = scheduler(SchedulerConfig::default());
    scheduler.pause();
    scheduler
      .add_directory(dir.path().to_path_buf(), true, RootFilter::none())
      .await
      .unwrap();

    let (_, checked) = tokio::join!(
      scheduler.wait_for_crawls(),
      scheduler.check_file(&a, priority::URGENT, false)
    );
    checked.unwrap();
    scheduler.wait_for_crawls().await;

    assert_eq!(scheduler.queued(), 2, "the check collapsed into the crawl's item");
    assert_eq!(scheduler.pending_kind(&b), Some(WorkKind::Created));

    scheduler.resume();
    let order = drain(&scheduler, 2).await;
    assert_eq!(order, vec![(a, priority::URGENT), (b, priority::BACKGROUND)]);
    assert!(!scheduler.has_pending_work());
  }

  #[tokio::test]
  async fn test_crawl_then_check_keeps_created_kind() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.txt");
    tokio::fs::write(&a, "alpha").await.unwrap();

    let scheduler = scheduler(SchedulerConfig::default());
    scheduler.pause();
    scheduler
      .add_directory(dir.path().to_path_buf(), true, RootFilter::none())
      .await
      .unwrap();
    scheduler.wait_for_crawls().await;
    scheduler.check_file(&a, priority::URGENT, false).await.unwrap();

    assert_eq!(scheduler.queued(), 1);
    assert_eq!(scheduler.pending_kind(&a), Some(WorkKind::Created));
  }

  fn fixed_items(scheduler: &CrawlScheduler) {
    let items = [
      ("/docs/c.txt", priority::BACKGROUND),
      ("/docs/a.txt", priority::DEFAULT),
      ("/docs/d.txt", priority::URGENT),
      ("/docs/b.txt", priority::DEFAULT),
      ("/docs/e.txt", priority::BACKGROUND),
    ];
    for (path, prio) in items {
      scheduler.enqueue(WorkItem::new(PathBuf::from(path), WorkKind::Updated, prio));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_throttle_changes_latency_not_order() {
    let delay = Duration::from_millis(100);
    let config = |throttle: f64| SchedulerConfig {
      max_throttle_delay: delay,
      initial_throttle: throttle,
    };

    let fast = scheduler(config(0.0));
    fixed_items(&fast);
    let started = Instant::now();
    let fast_order = drain(&fast, 5).await;
    let fast_elapsed = started.elapsed();

    let slow = scheduler(config(0.9));
    fixed_items(&slow);
    let started = Instant::now();
    let slow_order = drain(&slow, 5).await;
    let slow_elapsed = started.elapsed();

    assert_eq!(fast_order, slow_order);
    assert_eq!(
      fast_order.iter().map(|(p, _)| p.to_str().unwrap()).collect::<Vec<_>>(),
      vec!["/docs/d.txt", "/docs/a.txt", "/docs/b.txt", "/docs/c.txt", "/docs/e.txt"]
    );
    assert!(fast_elapsed < delay, "unthrottled drain is immediate");
    assert!(
      slow_elapsed >= delay.mul_f64(0.9) * 4,
      "throttled drain waits between dequeues, took {slow_elapsed:?}"
    );
  }

  #[tokio::test]
  async fn test_set_throttle_accepts_only_unit_range() {
    let scheduler = scheduler(SchedulerConfig::default());
    assert_eq!(scheduler.set_throttle(0.0).unwrap(), 0.0);
    assert!(scheduler.set_throttle(3.0).is_err());
    assert!(scheduler.set_throttle(-1.0).is_err());
    assert!(scheduler.set_throttle(f64::NAN).is_err());
    assert_eq!(scheduler.throttle(), 0.0);
  }
}
