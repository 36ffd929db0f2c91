//! Connect command - serve one controller until it quits

use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use cmdpipe::{
  Config, DispatchEvent, Dispatcher,
  config::DispatchConfig,
  parser::{Demultiplexer, JsonFramer, Parser, StreamId},
};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

type JsonStreams = Demultiplexer<Parser<JsonFramer<Value>>>;

/// Connect to the controller socket and serve it
pub async fn cmd_connect(config: Config, socket: Option<PathBuf>) -> Result<()> {
  let path = socket.unwrap_or_else(|| config.transport.socket_path());
  info!(path = %path.display(), "Connecting to controller");

  let dispatcher = Dispatcher::connect_to(&path, &config)
    .await
    .with_context(|| format!("Failed to connect to {:?}", path))?;

  serve(dispatcher, &config.dispatch).await
}

enum Step {
  Event(DispatchEvent),
  Tick,
  Disconnected,
  Interrupted,
}

/// Tick loop. While idle it waits for the next control event; while a run is
/// active it steps the run once per tick and polls for control events between
/// steps.
async fn serve(mut dispatcher: Dispatcher, config: &DispatchConfig) -> Result<()> {
  let mut ticker = tokio::time::interval(config.tick_interval());
  ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);

  let mut active: Option<Loopback> = None;

  loop {
    let step = if active.is_some() {
      tokio::select! {
        _ = &mut ctrl_c => Step::Interrupted,
        _ = ticker.tick() => Step::Tick,
      }
    } else {
      tokio::select! {
        _ = &mut ctrl_c => Step::Interrupted,
        event = dispatcher.next_event() => event.map_or(Step::Disconnected, Step::Event),
      }
    };

    let event = match step {
      Step::Interrupted => {
        info!("Interrupted, sending QUIT");
        dispatcher.quit().await;
        return Ok(());
      }
      Step::Disconnected => {
        info!("Controller disconnected");
        dispatcher.close().await;
        return Ok(());
      }
      Step::Event(event) => event,
      Step::Tick => {
        // Sampled before stepping: once the peer is gone and every buffered line
        // has been routed, this step sees the last of the run
        let abandoned = !dispatcher.is_connected() && dispatcher.backlog() == 0;
        let finished = match active.as_mut() {
          Some(run) => run.step(&dispatcher).await?,
          None => false,
        };
        if finished {
          active = None;
          dispatcher.finish_run().await?;
        } else if abandoned {
          warn!("Controller disconnected during a run");
          dispatcher.close().await;
          return Ok(());
        }

        match dispatcher.tick().await {
          Some(event) => event,
          None => continue,
        }
      }
    };

    match event {
      DispatchEvent::Run(name) if active.is_some() => {
        warn!(experiment = %name, "Run requested while another run is active");
        dispatcher
          .writer()
          .write_error(format!("Experiment \"{name}\" requested while a run is in progress."))
          .await?;
        dispatcher.accept_next();
      }
      DispatchEvent::Run(name) if name == Loopback::NAME => {
        active = Some(Loopback::start(&dispatcher));
      }
      DispatchEvent::Run(name) => {
        warn!(experiment = %name, "No runner for experiment");
        dispatcher
          .writer()
          .write_error(format!("No runner for experiment \"{name}\"."))
          .await?;
        dispatcher.accept_next();
      }
      DispatchEvent::Quit => {
        dispatcher.quit().await;
        return Ok(());
      }
    }
  }
}

// ============================================================================
// Loopback experiment
// ============================================================================

/// Echoes every JSON object received on a stream back to that stream.
///
/// A stream is open once it has produced a batch, and the run ends once every
/// open stream has sent END. A stream whose payloads never parse holds nothing
/// open.
struct Loopback {
  streams: Arc<JsonStreams>,
  open: BTreeSet<StreamId>,
  ended: usize,
  echoed: usize,
}

impl Loopback {
  const NAME: &str = "loopback";

  fn start(dispatcher: &Dispatcher) -> Self {
    info!("Starting loopback run");
    let streams = dispatcher.stack().add_new::<JsonStreams>();
    dispatcher.accept_next();
    Self {
      streams,
      open: BTreeSet::new(),
      ended: 0,
      echoed: 0,
    }
  }

  /// Handle everything routed since the last step. Returns true when the run is over.
  async fn step(&mut self, dispatcher: &Dispatcher) -> Result<bool> {
    while let Some(envelope) = self.streams.next_envelope() {
      // Partial objects and broken payloads produce no batch and were already accepted
      let Some(batch) = self.streams.parser_for(envelope.stream).next() else {
        continue;
      };

      for object in &batch.objects {
        dispatcher.writer().write_to(envelope.stream, object).await?;
      }
      self.echoed += batch.objects.len();
      dispatcher.accept_next();

      if batch.is_end {
        debug!(stream = %envelope.stream, "Stream ended");
        self.streams.remove(envelope.stream);
        self.open.remove(&envelope.stream);
        self.ended += 1;
      } else {
        self.open.insert(envelope.stream);
      }
    }

    if self.ended == 0 || !self.open.is_empty() {
      return Ok(false);
    }

    dispatcher.stack().pop(&self.streams)?;
    info!(streams = self.ended, objects = self.echoed, "Loopback run finished");
    Ok(true)
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

  use super::*;

  struct Controller {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
  }

  impl Controller {
    async fn send(&mut self, payload: &str) {
      self.writer.write_all(payload.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> String {
      tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
        .await
        .expect("timed out waiting for a line")
        .unwrap()
        .expect("stream closed")
    }
  }

  fn start() -> (tokio::task::JoinHandle<Result<()>>, Controller) {
    let config = Config::default();
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let dispatcher = Dispatcher::from_stream(local, &config);
    let server = tokio::spawn(async move { serve(dispatcher, &config.dispatch).await });

    let (read, writer) = tokio::io::split(remote);
    let controller = Controller {
      lines: BufReader::new(read).lines(),
      writer,
    };
    (server, controller)
  }

  #[tokio::test]
  async fn test_loopback_run_then_quit() {
    let (server, mut controller) = start();

    controller
      .send("run loopback\n0 {\"a\": 1}\n1 {\"b\": [1,\n1 2]}\n0 END\n1 END\n")
      .await;
    assert_eq!(controller.recv().await, "0 {\"a\":1}");
    assert_eq!(controller.recv().await, "1 {\"b\":[1,2]}");
    assert_eq!(controller.recv().await, "END");

    controller.send("quit\n").await;
    assert_eq!(controller.recv().await, "QUIT");
    server.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_unknown_runner() {
    let (server, mut controller) = start();

    controller.send("run bogus\nquit\n").await;
    assert_eq!(controller.recv().await, "Error: No runner for experiment \"bogus\".");
    assert_eq!(controller.recv().await, "QUIT");
    server.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_run_while_busy() {
    let (server, mut controller) = start();

    controller.send("run loopback\nrun loopback\n0 {\"n\": 1}\n0 END\n").await;
    assert_eq!(
      controller.recv().await,
      "Error: Experiment \"loopback\" requested while a run is in progress."
    );
    assert_eq!(controller.recv().await, "0 {\"n\":1}");
    assert_eq!(controller.recv().await, "END");

    controller.send("quit\n").await;
    assert_eq!(controller.recv().await, "QUIT");
    server.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_run_completes_after_controller_hangs_up() {
    let (server, mut controller) = start();

    // Everything is buffered before the peer goes away
    controller
      .send("run loopback\n0 {\"a\": 1}\n1 {\"b\": 2}\n0 END\n1 END\n")
      .await;
    controller.writer.shutdown().await.unwrap();

    assert_eq!(controller.recv().await, "0 {\"a\":1}");
    assert_eq!(controller.recv().await, "1 {\"b\":2}");
    assert_eq!(controller.recv().await, "END");
    tokio::time::timeout(Duration::from_secs(5), server)
      .await
      .expect("serve should return")
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn test_unfinished_run_is_abandoned_after_hang_up() {
    let (server, mut controller) = start();

    controller.send("run loopback\n0 {\"a\": 1}\n").await;
    controller.writer.shutdown().await.unwrap();

    assert_eq!(controller.recv().await, "0 {\"a\":1}");
    tokio::time::timeout(Duration::from_secs(5), server)
      .await
      .expect("serve should return")
      .unwrap()
      .unwrap();
    // No END for a run that never finished
    assert_eq!(controller.lines.next_line().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_broken_stream_does_not_hold_run_open() {
    let (server, mut controller) = start();

    controller.send("run loopback\n2 {\"a\": }\n0 {\"a\": 1}\n0 END\n").await;
    assert_eq!(controller.recv().await, "0 {\"a\":1}");
    assert_eq!(controller.recv().await, "END");

    controller.send("quit\n").await;
    assert_eq!(controller.recv().await, "QUIT");
    server.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_disconnect_while_idle() {
    let (server, controller) = start();
    drop(controller);
    tokio::time::timeout(Duration::from_secs(5), server)
      .await
      .expect("serve should return")
      .unwrap()
      .unwrap();
  }
}
