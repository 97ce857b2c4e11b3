//! Client record lifetime across requests and cleanup deadlines.

#[cfg(test)]
mod tests {
  use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
  };

  use tokio_util::sync::CancellationToken;

  use crate::actor::{
    __tests__::helpers::CountingResolver,
    lifecycle::{CallerId, RequestTracker, TrackerConfig},
  };

  const CLEANUP: Duration = Duration::from_secs(300);

  fn tracker(resolver: Arc<CountingResolver>) -> RequestTracker {
    RequestTracker::new(
      resolver,
      TrackerConfig {
        lookup_enabled: true,
        cleanup_delay: CLEANUP,
      },
      CancellationToken::new(),
    )
  }

  #[tokio::test(start_paused = true)]
  async fn test_idle_client_is_evicted_after_deadline() {
    let resolver = Arc::new(CountingResolver::default());
    let tracker = tracker(Arc::clone(&resolver));
    let caller = CallerId::from("caller-A");

    let mut handles = Vec::new();
    for i in 0..3 {
      handles.push(tracker.begin_request(&caller, format!("request {i}")).await);
    }
    assert_eq!(resolver.lookups.load(Ordering::SeqCst), 1, "one lookup per client");
    assert_eq!(tracker.client(&caller).map(|c| c.active_requests), Some(3));

    for handle in handles {
      tracker.end_request(handle, None);
    }
    let summary = tracker.client(&caller).expect("record survives until the deadline");
    assert_eq!(summary.active_requests, 0);
    assert!(summary.idle);

    tokio::time::sleep(CLEANUP - Duration::from_secs(1)).await;
    assert_eq!(tracker.client_count(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(tracker.client_count(), 0, "evicted once the deadline passed");
  }

  #[tokio::test(start_paused = true)]
  async fn test_request_before_deadline_reuses_record() {
    let resolver = Arc::new(CountingResolver::default());
    let tracker = tracker(Arc::clone(&resolver));
    let caller = CallerId::from("caller-A");

    let handle = tracker.begin_request(&caller, "first").await;
    let first = handle.client().expect("lookup enabled");
    tracker.end_request(handle, None);

    tokio::time::sleep(Duration::from_secs(100)).await;
    let handle = tracker.begin_request(&caller, "second").await;
    let second = handle.client().expect("lookup enabled");
    assert!(Arc::ptr_eq(&first, &second), "record reused");
    assert_eq!(resolver.lookups.load(Ordering::SeqCst), 1);
    tracker.end_request(handle, None);
    drop((first, second));

    // Past the first deadline, inside the re-armed one
    tokio::time::sleep(Duration::from_secs(250)).await;
    assert_eq!(tracker.client_count(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(tracker.client_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_active_client_is_never_evicted() {
    let resolver = Arc::new(CountingResolver::default());
    let tracker = tracker(resolver);
    let caller = CallerId::for_pid(4242);

    let done = tracker.begin_request(&caller, "short").await;
    tracker.end_request(done, None);
    let long = tracker.begin_request(&caller, "long").await;

    tokio::time::sleep(CLEANUP * 2).await;
    let summary = tracker.client(&caller).expect("still active");
    assert_eq!(summary.pid, Some(4242));
    assert_eq!(summary.binary.as_deref(), Some("test-client"));
    assert_eq!(summary.active_requests, 1);

    tracker.end_request(long, Some(&"boom" as &dyn std::fmt::Display));
    tokio::time::sleep(CLEANUP + Duration::from_secs(1)).await;
    assert_eq!(tracker.client_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_cancels_pending_cleanup() {
    let tracker = tracker(Arc::new(CountingResolver::default()));
    let caller = CallerId::from("caller-B");

    let handle = tracker.begin_request(&caller, "only").await;
    tracker.end_request(handle, None);
    tracker.shutdown();

    tokio::time::sleep(CLEANUP * 2).await;
    assert_eq!(tracker.client_count(), 1, "timer cancelled, record left for teardown");
  }
}
