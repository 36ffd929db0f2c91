//! Transport - owns one duplex byte stream to the controller process
//!
//! The stream is split once: the read half runs a background loop that hands
//! every line to a `LineHandler`, and the write half lives behind a cloneable
//! `LineWriter` so any component can send lines back.
//!
//! # Lifecycle
//!
//! 1. `connect()` opens the controller socket (or any duplex stream is supplied)
//! 2. `Transport::spawn()` splits the stream, builds the handler and starts reading
//! 3. The read loop stops on `QUIT`, end of stream, a read error, or `close()`
//! 4. `close()` signals stop, waits a bounded time for the loop, then closes the
//!    writer and drops the reader and connection. Teardown errors are logged only;
//!    the peer may already be gone.

use std::{
  fmt::Display,
  path::Path,
  sync::{Arc, Mutex},
  time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
  io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
  net::UnixStream,
  task::JoinHandle,
};
use tokio_util::{
  codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError},
  sync::CancellationToken,
};
use tracing::{debug, info, trace, warn};

use crate::{
  config::TransportConfig,
  error::TransportError,
  lock,
  parser::{END_TOKEN, StreamId},
};

/// Line that ends the whole connection
pub const QUIT_TOKEN: &str = "QUIT";

/// Any full-duplex byte stream the transport can own.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> DuplexStream for T {}

type Connection = Box<dyn DuplexStream>;
type LineReader = FramedRead<ReadHalf<Connection>, LinesCodec>;
type LineSink = FramedWrite<WriteHalf<Connection>, LinesCodec>;

/// Receives each trimmed line read off the stream.
#[async_trait]
pub trait LineHandler: Send + Sync {
  async fn handle_line(&self, line: String);
}

/// Open the controller socket, giving up after the configured timeout.
pub async fn connect(path: &Path, config: &TransportConfig) -> Result<UnixStream, TransportError> {
  let timeout = config.connect_timeout();
  let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
    .await
    .map_err(|_| TransportError::ConnectTimeout {
      path: path.to_path_buf(),
      timeout,
    })??;
  info!(?path, "Connected to controller");
  Ok(stream)
}

// ============================================================================
// LineWriter
// ============================================================================

/// Write half of a transport. Every write is flushed before it returns.
#[derive(Clone)]
pub struct LineWriter {
  sink: Arc<tokio::sync::Mutex<Option<LineSink>>>,
}

impl LineWriter {
  fn new(sink: LineSink) -> Self {
    Self {
      sink: Arc::new(tokio::sync::Mutex::new(Some(sink))),
    }
  }

  /// Send one line. `line` must not contain a newline.
  pub async fn write(&self, line: impl Into<String>) -> Result<(), TransportError> {
    let line = line.into();
    let mut guard = self.sink.lock().await;
    let sink = guard.as_mut().ok_or(TransportError::Closed)?;
    trace!(%line, "Writing line");
    sink.send(line).await?;
    Ok(())
  }

  pub async fn write_error(&self, message: impl Display) -> Result<(), TransportError> {
    self.write(format!("Error: {message}")).await
  }

  pub async fn write_warning(&self, message: impl Display) -> Result<(), TransportError> {
    self.write(format!("Warning: {message}")).await
  }

  /// Send a line addressed to one multiplexed stream.
  pub async fn write_to(&self, stream: StreamId, line: impl Display) -> Result<(), TransportError> {
    self.write(format!("{stream} {line}")).await
  }

  pub async fn write_end(&self) -> Result<(), TransportError> {
    self.write(END_TOKEN).await
  }

  pub async fn write_quit(&self) -> Result<(), TransportError> {
    self.write(QUIT_TOKEN).await
  }

  pub async fn is_closed(&self) -> bool {
    self.sink.lock().await.is_none()
  }

  /// Flush and shut down the write half. Later writes fail with `Closed`.
  async fn close(&self) {
    let Some(mut sink) = self.sink.lock().await.take() else {
      return;
    };
    if let Err(e) = SinkExt::<String>::close(&mut sink).await {
      warn!(error = %e, "Error closing transport writer");
    }
  }
}

// ============================================================================
// Transport
// ============================================================================

pub struct Transport {
  writer: LineWriter,
  /// Asks the read loop to stop
  stop: CancellationToken,
  /// Cancelled by the read loop when it exits for any reason
  finished: CancellationToken,
  read_task: Mutex<Option<JoinHandle<LineReader>>>,
  close_timeout: Duration,
}

impl Transport {
  /// Take ownership of `stream` and start reading.
  ///
  /// `build` receives the writer and returns the handler for incoming lines,
  /// so a handler can answer the peer directly.
  pub fn spawn<S, H, F>(stream: S, config: &TransportConfig, build: F) -> (Self, Arc<H>)
  where
    S: DuplexStream,
    H: LineHandler + 'static,
    F: FnOnce(LineWriter) -> Arc<H>,
  {
    let connection: Connection = Box::new(stream);
    let (read_half, write_half) = tokio::io::split(connection);
    let reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(config.max_line_length));
    let writer = LineWriter::new(FramedWrite::new(write_half, LinesCodec::new()));

    let handler = build(writer.clone());
    let stop = CancellationToken::new();
    let finished = CancellationToken::new();

    let read_task = tokio::spawn(read_loop(
      reader,
      Arc::clone(&handler) as Arc<dyn LineHandler>,
      stop.clone(),
      finished.clone(),
    ));

    let transport = Self {
      writer,
      stop,
      finished,
      read_task: Mutex::new(Some(read_task)),
      close_timeout: config.close_timeout(),
    };
    (transport, handler)
  }

  pub fn writer(&self) -> &LineWriter {
    &self.writer
  }

  pub async fn write(&self, line: impl Into<String>) -> Result<(), TransportError> {
    self.writer.write(line).await
  }

  /// Whether the read loop is still running
  pub fn is_reading(&self) -> bool {
    !self.finished.is_cancelled()
  }

  /// Resolves once the read loop has exited.
  pub async fn disconnected(&self) {
    self.finished.cancelled().await
  }

  /// Token cancelled when the read loop exits
  pub fn disconnect_token(&self) -> CancellationToken {
    self.finished.clone()
  }

  /// Stop reading and release the stream. Safe to call more than once.
  pub async fn close(&self) {
    self.stop.cancel();

    let task = lock(&self.read_task).take();
    let reader = match task {
      Some(mut handle) => match tokio::time::timeout(self.close_timeout, &mut handle).await {
        Ok(Ok(reader)) => Some(reader),
        Ok(Err(e)) => {
          warn!(error = %e, "Read loop ended abnormally");
          None
        }
        Err(_) => {
          warn!(timeout = ?self.close_timeout, "Failed to close transport.");
          handle.abort();
          None
        }
      },
      None => None,
    };

    // Writer, then reader, then the connection itself (dropped with the last half)
    self.writer.close().await;
    drop(reader);
    debug!("Transport closed");
  }
}

impl Drop for Transport {
  fn drop(&mut self) {
    self.stop.cancel();
  }
}

async fn read_loop(
  mut reader: LineReader,
  handler: Arc<dyn LineHandler>,
  stop: CancellationToken,
  finished: CancellationToken,
) -> LineReader {
  let mut skipped = false;
  loop {
    let next = tokio::select! {
      biased;

      _ = stop.cancelled() => {
        debug!("Read loop stopped");
        break;
      }

      next = reader.next() => next,
    };

    match next {
      Some(Ok(line)) => {
        skipped = false;
        let line = line.trim();
        if line == QUIT_TOKEN {
          info!("Peer sent QUIT");
          break;
        }
        trace!(%line, "Read line");
        handler.handle_line(line.to_string()).await;
      }
      Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
        warn!(max = reader.decoder().max_length(), "Discarding over-long line");
        skipped = true;
      }
      // FramedRead yields a single None after a decoder error, then resumes
      None if skipped => skipped = false,
      Some(Err(LinesCodecError::Io(e))) => {
        warn!(error = %e, "Error reading from peer");
        break;
      }
      None => {
        info!("Peer closed the stream");
        break;
      }
    }
  }

  finished.cancel();
  reader
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream as MemStream};

  use super::*;

  #[derive(Default)]
  struct Recorder {
    lines: Mutex<Vec<String>>,
  }

  #[async_trait]
  impl LineHandler for Recorder {
    async fn handle_line(&self, line: String) {
      lock(&self.lines).push(line);
    }
  }

  fn spawn_pair(config: &TransportConfig) -> (Transport, Arc<Recorder>, MemStream) {
    let (local, remote) = tokio::io::duplex(4096);
    let (transport, recorder) = Transport::spawn(local, config, |_| Arc::new(Recorder::default()));
    (transport, recorder, remote)
  }

  #[tokio::test]
  async fn test_lines_are_trimmed_and_delivered() {
    let (transport, recorder, mut remote) = spawn_pair(&TransportConfig::default());

    remote.write_all(b"  first  \nsecond\r\n").await.unwrap();
    remote.shutdown().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), transport.disconnected())
      .await
      .expect("read loop should end at end of stream");
    assert_eq!(*lock(&recorder.lines), vec!["first".to_string(), "second".to_string()]);
    assert!(!transport.is_reading());
  }

  #[tokio::test]
  async fn test_quit_ends_the_read_loop() {
    let (transport, recorder, mut remote) = spawn_pair(&TransportConfig::default());

    remote.write_all(b"one\nQUIT\ntwo\n").await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), transport.disconnected())
      .await
      .expect("QUIT should stop reading");
    assert_eq!(*lock(&recorder.lines), vec!["one".to_string()]);
  }

  #[tokio::test]
  async fn test_over_long_lines_are_skipped() {
    let config = TransportConfig {
      max_line_length: 8,
      ..Default::default()
    };
    let (transport, recorder, mut remote) = spawn_pair(&config);

    remote.write_all(b"short\nthis line is far too long\nok\n").await.unwrap();
    remote.shutdown().await.unwrap();
    transport.disconnected().await;

    assert_eq!(*lock(&recorder.lines), vec!["short".to_string(), "ok".to_string()]);
  }

  #[tokio::test]
  async fn test_writer_formats() {
    let (transport, _recorder, remote) = spawn_pair(&TransportConfig::default());
    let writer = transport.writer().clone();

    writer.write("plain").await.unwrap();
    writer.write_error("boom").await.unwrap();
    writer.write_warning("careful").await.unwrap();
    writer.write_to(StreamId(3), "{\"Number\": 1}").await.unwrap();
    writer.write_end().await.unwrap();
    writer.write_quit().await.unwrap();

    let mut lines = BufReader::new(remote).lines();
    let mut received = Vec::new();
    for _ in 0..6 {
      received.push(lines.next_line().await.unwrap().unwrap());
    }
    assert_eq!(
      received,
      vec!["plain", "Error: boom", "Warning: careful", "3 {\"Number\": 1}", "END", "QUIT"]
    );
  }

  #[tokio::test]
  async fn test_close_stops_loop_and_writer() {
    let (transport, _recorder, remote) = spawn_pair(&TransportConfig::default());
    let writer = transport.writer().clone();

    tokio::time::timeout(Duration::from_secs(2), transport.close())
      .await
      .expect("close should not hang on an idle peer");

    assert!(!transport.is_reading());
    assert!(writer.is_closed().await);
    assert!(matches!(writer.write("late").await, Err(TransportError::Closed)));

    // The peer sees end of stream
    let mut lines = BufReader::new(remote).lines();
    assert_eq!(lines.next_line().await.unwrap(), None);

    // Second close is a no-op
    transport.close().await;
  }

  #[tokio::test]
  async fn test_connect_to_unix_socket() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = temp.path().join("ctl.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();

    let accept = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let mut stream = BufReader::new(stream);
      let mut line = String::new();
      stream.read_line(&mut line).await.unwrap();
      line
    });

    let stream = connect(&path, &TransportConfig::default()).await.unwrap();
    let (transport, _recorder) = Transport::spawn(stream, &TransportConfig::default(), |_| Arc::new(Recorder::default()));
    transport.write("hello").await.unwrap();

    assert_eq!(accept.await.unwrap(), "hello\n");
    transport.close().await;
  }

  #[tokio::test]
  async fn test_connect_missing_socket_fails() {
    let temp = tempfile::TempDir::new().unwrap();
    let result = connect(&temp.path().join("missing.sock"), &TransportConfig::default()).await;
    assert!(matches!(result, Err(TransportError::Io(_))));
  }
}
