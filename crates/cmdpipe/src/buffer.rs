//! BackpressureBuffer - one line in flight between the reader and the consumer
//!
//! The transport reads as fast as the peer writes and never blocks: every line
//! goes into an unbounded queue. A background loop releases those lines to the
//! downstream handler one at a time, and only after the consumer has called
//! `accept_next()` for the previous one.
//!
//! # Lifecycle
//!
//! 1. `BackpressureBuffer::spawn()` starts the release loop with the permit granted
//! 2. `on_read_line()` queues lines (usually called by the transport)
//! 3. The loop waits for a line, then for the permit, then calls the handler
//! 4. `close()` wakes the loop wherever it is waiting and waits for it to exit

use std::{
  sync::{Arc, Mutex},
  time::Duration,
};

use async_trait::async_trait;
use tokio::{
  sync::{Notify, mpsc, watch},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{lock, transport::LineHandler};

// ============================================================================
// AcceptSignal
// ============================================================================

/// Single permit gating the release of the next line.
///
/// Granting an already granted permit has no effect, so at most one line is
/// released per grant.
#[derive(Clone)]
pub struct AcceptSignal {
  permit: Arc<Notify>,
}

impl AcceptSignal {
  /// A signal whose first permit is already granted
  pub fn new() -> Self {
    let permit = Notify::new();
    permit.notify_one();
    Self {
      permit: Arc::new(permit),
    }
  }

  pub fn accept_next(&self) {
    self.permit.notify_one();
  }

  async fn acquire(&self) {
    self.permit.notified().await;
  }
}

impl Default for AcceptSignal {
  fn default() -> Self {
    Self::new()
  }
}

// ============================================================================
// BackpressureBuffer
// ============================================================================

pub struct BackpressureBuffer {
  lines: mpsc::UnboundedSender<String>,
  signal: AcceptSignal,
  /// Lines received but not yet fully handled downstream
  backlog: watch::Sender<usize>,
  closing: CancellationToken,
  task: Mutex<Option<JoinHandle<()>>>,
  close_timeout: Duration,
}

impl BackpressureBuffer {
  pub fn spawn(downstream: Arc<dyn LineHandler>, close_timeout: Duration) -> Self {
    Self::with_signal(downstream, AcceptSignal::new(), close_timeout)
  }

  /// Start the release loop gated by an existing signal, for downstreams that
  /// need to accept lines themselves.
  pub fn with_signal(downstream: Arc<dyn LineHandler>, signal: AcceptSignal, close_timeout: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let (backlog, _) = watch::channel(0);
    let closing = CancellationToken::new();

    let task = tokio::spawn(release_loop(
      rx,
      downstream,
      signal.clone(),
      backlog.clone(),
      closing.clone(),
    ));

    Self {
      lines: tx,
      signal,
      backlog,
      closing,
      task: Mutex::new(Some(task)),
      close_timeout,
    }
  }

  /// Queue a line. Never blocks.
  pub fn on_read_line(&self, line: String) {
    self.backlog.send_modify(|n| *n += 1);
    if self.lines.send(line).is_err() {
      self.backlog.send_modify(|n| *n = n.saturating_sub(1));
      debug!("Buffer closed, dropping line");
    }
  }

  /// Allow the next queued line through.
  pub fn accept_next(&self) {
    trace!("Accept next line");
    self.signal.accept_next();
  }

  pub fn accept_signal(&self) -> AcceptSignal {
    self.signal.clone()
  }

  /// Lines received but not yet fully handled downstream
  pub fn backlog(&self) -> usize {
    *self.backlog.borrow()
  }

  /// Resolves once every received line has been handled downstream.
  pub async fn drained(&self) {
    let mut backlog = self.backlog.subscribe();
    // The sender lives in `self`, so this only returns once the count hits zero
    let _ = backlog.wait_for(|n| *n == 0).await;
  }

  pub fn is_closed(&self) -> bool {
    self.closing.is_cancelled()
  }

  /// Stop the release loop. Queued lines are discarded. Safe to call more than once.
  pub async fn close(&self) {
    self.closing.cancel();

    let Some(mut handle) = lock(&self.task).take() else {
      return;
    };
    match tokio::time::timeout(self.close_timeout, &mut handle).await {
      Ok(Ok(())) => debug!("Buffer closed"),
      Ok(Err(e)) => warn!(error = %e, "Buffer loop ended abnormally"),
      Err(_) => {
        warn!(timeout = ?self.close_timeout, "Failed to close communication buffer.");
        handle.abort();
      }
    }
  }
}

impl Drop for BackpressureBuffer {
  fn drop(&mut self) {
    self.closing.cancel();
  }
}

#[async_trait]
impl LineHandler for BackpressureBuffer {
  async fn handle_line(&self, line: String) {
    self.on_read_line(line);
  }
}

async fn release_loop(
  mut lines: mpsc::UnboundedReceiver<String>,
  downstream: Arc<dyn LineHandler>,
  signal: AcceptSignal,
  backlog: watch::Sender<usize>,
  closing: CancellationToken,
) {
  loop {
    let line = tokio::select! {
      biased;

      _ = closing.cancelled() => break,

      line = lines.recv() => match line {
        Some(line) => line,
        None => break,
      },
    };

    tokio::select! {
      biased;

      _ = closing.cancelled() => break,

      _ = signal.acquire() => {}
    }

    downstream.handle_line(line).await;
    backlog.send_modify(|n| *n = n.saturating_sub(1));
  }

  debug!(dropped = lines.len(), "Buffer loop exited");
}
