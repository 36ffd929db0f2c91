//! Dispatcher - the per-connection top level
//!
//! Wires one `Transport`, one `BackpressureBuffer` and a root `ParserStack`
//! together and turns control commands into events for the application's tick
//! loop. Everything is created in `from_stream` and torn down together by
//! `close`.
//!
//! ```text
//! Transport read loop -> BackpressureBuffer -> StackRouter -> ParserStack
//!                                                              |- Parser<ReportGrammar>
//!                                                              |- Parser<ControlGrammar>
//!                                                              '- entries pushed by the application
//! ```
//!
//! # Accepting lines
//!
//! Only one line is in flight at a time. The router accepts the next line by
//! itself when the current one produced no command or failed every parser (the
//! failure is reported to the peer as a warning). When a command was queued,
//! whoever consumes it calls `accept_next()` once done with it. Reports and
//! `set` commands are consumed by `tick()`; `run` and `quit` are handed to the
//! application.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  buffer::{AcceptSignal, BackpressureBuffer},
  config::{Config, DispatchConfig},
  error::TransportError,
  parser::{ControlCommand, ControlGrammar, Parsed, Parser, ParserStack, Report, ReportGrammar},
  transport::{self, DuplexStream, LineHandler, LineWriter, Transport},
};

/// Something the application has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
  /// Start the named experiment. Call `finish_run()` when it is done.
  Run(String),
  /// The controller asked us to shut down.
  Quit,
}

// ============================================================================
// StackRouter
// ============================================================================

/// Buffer downstream: offers each released line to the root stack.
struct StackRouter {
  stack: Arc<ParserStack>,
  writer: LineWriter,
  accept: AcceptSignal,
}

#[async_trait]
impl LineHandler for StackRouter {
  async fn handle_line(&self, line: String) {
    match self.stack.try_parse(&line) {
      Ok(Parsed::Command) => {}
      Ok(Parsed::Nothing) => self.accept.accept_next(),
      Err(e) => {
        debug!(%line, "Line not recognised by any parser");
        // One wire line per report
        let report = e.to_string().replace('\n', " | ");
        if let Err(write_err) = self.writer.write_warning(report).await {
          warn!(error = %write_err, "Failed to report unparsed line to peer");
        }
        self.accept.accept_next();
      }
    }
  }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct Dispatcher {
  config: DispatchConfig,
  transport: Transport,
  buffer: Arc<BackpressureBuffer>,
  stack: Arc<ParserStack>,
  reports: Arc<Parser<ReportGrammar>>,
  control: Arc<Parser<ControlGrammar>>,
  settings: BTreeMap<String, String>,
}

impl Dispatcher {
  /// Connect to the configured controller socket.
  pub async fn connect(config: &Config) -> Result<Self, TransportError> {
    Self::connect_to(&config.transport.socket_path(), config).await
  }

  pub async fn connect_to(path: &Path, config: &Config) -> Result<Self, TransportError> {
    let stream = transport::connect(path, &config.transport).await?;
    Ok(Self::from_stream(stream, config))
  }

  /// Build the whole pipeline over an already open stream.
  pub fn from_stream<S: DuplexStream>(stream: S, config: &Config) -> Self {
    let stack = Arc::new(ParserStack::new());
    let reports = stack.add_new::<Parser<ReportGrammar>>();
    let control = stack.add_new::<Parser<ControlGrammar>>();

    let accept = AcceptSignal::new();
    let close_timeout = config.transport.close_timeout();
    let (transport, buffer) = Transport::spawn(stream, &config.transport, |writer| {
      let router = Arc::new(StackRouter {
        stack: Arc::clone(&stack),
        writer,
        accept: accept.clone(),
      });
      Arc::new(BackpressureBuffer::with_signal(router, accept.clone(), close_timeout))
    });

    Self {
      config: config.dispatch.clone(),
      transport,
      buffer,
      stack,
      reports,
      control,
      settings: BTreeMap::new(),
    }
  }

  /// Root parser stack. Push application parsers here; pop them when done.
  pub fn stack(&self) -> &Arc<ParserStack> {
    &self.stack
  }

  pub fn writer(&self) -> &LineWriter {
    self.transport.writer()
  }

  /// Release the next buffered line.
  pub fn accept_next(&self) {
    self.buffer.accept_next();
  }

  /// Handle for consumers running on their own tasks
  pub fn accept_signal(&self) -> AcceptSignal {
    self.buffer.accept_signal()
  }

  pub fn setting(&self, name: &str) -> Option<&str> {
    self.settings.get(name).map(String::as_str)
  }

  pub fn settings(&self) -> &BTreeMap<String, String> {
    &self.settings
  }

  pub fn is_connected(&self) -> bool {
    self.transport.is_reading()
  }

  /// Lines read off the stream but not yet handled by the parser stack
  pub fn backlog(&self) -> usize {
    self.buffer.backlog()
  }

  pub async fn disconnected(&self) {
    self.transport.disconnected().await
  }

  /// Handle whatever the control parsers have queued, without waiting.
  ///
  /// Meant to be called once per simulation step.
  pub async fn tick(&mut self) -> Option<DispatchEvent> {
    while let Some(report) = self.reports.next() {
      self.handle_report(&report);
    }
    while let Some(command) = self.control.next() {
      if let Some(event) = self.handle_control(command).await {
        return Some(event);
      }
    }
    None
  }

  /// Wait for the next event. Returns `None` once the peer has disconnected
  /// and nothing is left to handle.
  pub async fn next_event(&mut self) -> Option<DispatchEvent> {
    let reports = Arc::clone(&self.reports);
    let control = Arc::clone(&self.control);
    let buffer = Arc::clone(&self.buffer);
    let disconnected: CancellationToken = self.transport.disconnect_token();

    loop {
      if let Some(event) = self.tick().await {
        return Some(event);
      }

      tokio::select! {
        biased;

        report = reports.next_async() => self.handle_report(&report),

        command = control.next_async() => {
          if let Some(event) = self.handle_control(command).await {
            return Some(event);
          }
        }

        // Lines already read are still routed before giving up
        _ = async {
          disconnected.cancelled().await;
          buffer.drained().await;
        } => {
          if reports.is_empty() && control.is_empty() {
            return None;
          }
        }
      }
    }
  }

  /// Tell the controller the current run is over and take the next line.
  pub async fn finish_run(&self) -> Result<(), TransportError> {
    self.transport.writer().write_end().await?;
    self.accept_next();
    Ok(())
  }

  /// Send `QUIT` and tear everything down.
  pub async fn quit(self) {
    if let Err(e) = self.transport.writer().write_quit().await {
      warn!(error = %e, "Failed to send QUIT");
    }
    self.close().await;
  }

  /// Stop reading, then stop releasing buffered lines.
  pub async fn close(&self) {
    self.transport.close().await;
    self.buffer.close().await;
    info!("Dispatcher closed");
  }

  fn handle_report(&self, report: &Report) {
    if report.is_error {
      error!("{}", report);
    } else {
      warn!("{}", report);
    }
    self.accept_next();
  }

  async fn handle_control(&mut self, command: ControlCommand) -> Option<DispatchEvent> {
    match command {
      ControlCommand::Set { name, value } => {
        info!(%name, %value, "Setting updated");
        self.settings.insert(name, value);
        self.accept_next();
        None
      }
      ControlCommand::Run { experiment } if !self.config.knows_experiment(&experiment) => {
        let message = format!("Experiment name \"{experiment}\" was not recognized.");
        warn!("{}", message);
        if let Err(e) = self.transport.writer().write_error(&message).await {
          warn!(error = %e, "Failed to report unknown experiment");
        }
        self.accept_next();
        None
      }
      ControlCommand::Run { experiment } => {
        info!(%experiment, "Run requested");
        Some(DispatchEvent::Run(experiment))
      }
      ControlCommand::Quit => {
        info!("Quit requested");
        Some(DispatchEvent::Quit)
      }
    }
  }
}
