//! Stream relay - send a message while splicing a byte source into memory
//!
//! Some replies are produced by a helper that writes into a pipe while the
//! request is still being answered. The transport needs complete messages,
//! so the relay sends the outgoing message and drains the source into a
//! growable buffer at the same time, then completes once with the buffer or
//! the first error.
//!
//! The completion callback runs exactly once on every path, including
//! cancellation and task abort. The source is closed before it runs.

use std::time::Instant;

use async_trait::async_trait;
use tokio::{io::AsyncRead, sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
  #[error("Transport error: {0}")]
  Transport(String),

  #[error("Peer reported failure: {0}")]
  Peer(String),

  #[error("Failed to read source: {0}")]
  Source(String),

  #[error("Relay cancelled")]
  Cancelled,
}

/// The other end of the exchange
#[async_trait]
pub trait RelayPeer: Send {
  /// Deliver `message` and wait for the peer's reply
  async fn exchange(&mut self, message: Vec<u8>) -> Result<(), RelayError>;
}

type OnComplete = Box<dyn FnOnce(Result<Vec<u8>, RelayError>) + Send>;

/// One relay in progress: the source, the sink it fills and who to tell
pub struct StreamJob<S> {
  request_id: Option<u64>,
  source: Option<S>,
  sink: Vec<u8>,
  on_complete: Option<OnComplete>,
}

impl<S> StreamJob<S>
where
  S: AsyncRead + Unpin + Send,
{
  fn new(source: S, request_id: Option<u64>, on_complete: OnComplete) -> Self {
    Self {
      request_id,
      source: Some(source),
      sink: Vec::new(),
      on_complete: Some(on_complete),
    }
  }

  async fn run<P>(mut self, peer: &mut P, message: Vec<u8>, cancel: &CancellationToken)
  where
    P: RelayPeer + ?Sized,
  {
    let started = Instant::now();
    let result = match self.source.as_mut() {
      Some(source) => pump(peer, message, source, &mut self.sink, cancel).await,
      None => Err(RelayError::Source("source already closed".to_string())),
    };

    match &result {
      Ok(()) => debug!(
        request_id = self.request_id,
        bytes = self.sink.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Relay complete"
      ),
      Err(e) => warn!(request_id = self.request_id, error = %e, "Relay failed"),
    }
    self.finish(result);
  }

  fn finish(&mut self, result: Result<(), RelayError>) {
    self.source.take();
    if let Some(on_complete) = self.on_complete.take() {
      let result = result.map(|()| std::mem::take(&mut self.sink));
      on_complete(result);
    }
  }
}

impl<S> Drop for StreamJob<S> {
  fn drop(&mut self) {
    // Only reached without a result when the relay task was aborted
    self.source.take();
    if let Some(on_complete) = self.on_complete.take() {
      on_complete(Err(RelayError::Cancelled));
    }
  }
}

async fn pump<P, S>(
  peer: &mut P,
  message: Vec<u8>,
  source: &mut S,
  sink: &mut Vec<u8>,
  cancel: &CancellationToken,
) -> Result<(), RelayError>
where
  P: RelayPeer + ?Sized,
  S: AsyncRead + Unpin + Send,
{
  let exchange = peer.exchange(message);
  let splice = async {
    tokio::io::copy(source, sink)
      .await
      .map(|_| ())
      .map_err(|e| RelayError::Source(e.to_string()))
  };

  tokio::select! {
    biased;

    _ = cancel.cancelled() => Err(RelayError::Cancelled),

    result = async { tokio::try_join!(exchange, splice) } => result.map(|_| ()),
  }
}

/// Send `message` to `peer` while draining `source`; `on_complete` receives
/// the accumulated bytes or the first error, exactly once.
pub fn send_and_relay<P, S, F>(
  mut peer: P,
  message: Vec<u8>,
  source: S,
  cancel: CancellationToken,
  request_id: Option<u64>,
  on_complete: F,
) -> JoinHandle<()>
where
  P: RelayPeer + 'static,
  S: AsyncRead + Unpin + Send + 'static,
  F: FnOnce(Result<Vec<u8>, RelayError>) + Send + 'static,
{
  let job = StreamJob::new(source, request_id, Box::new(on_complete));
  tokio::spawn(async move {
    job.run(&mut peer, message, &cancel).await;
  })
}

/// Future-returning form of [`send_and_relay`]
pub async fn relay<P, S>(
  peer: P,
  message: Vec<u8>,
  source: S,
  cancel: CancellationToken,
  request_id: Option<u64>,
) -> Result<Vec<u8>, RelayError>
where
  P: RelayPeer + 'static,
  S: AsyncRead + Unpin + Send + 'static,
{
  let (tx, rx) = oneshot::channel();
  send_and_relay(peer, message, source, cancel, request_id, move |result| {
    let _ = tx.send(result);
  });
  rx.await.unwrap_or(Err(RelayError::Cancelled))
}
