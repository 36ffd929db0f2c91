//! Test helpers for end-to-end pipeline tests.
//!
//! `Peer` plays the controller process on the far side of an in-memory duplex
//! stream, so the full transport -> buffer -> stack path runs without sockets.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

use crate::{Config, Dispatcher};

pub const WAIT: Duration = Duration::from_secs(5);

/// Payload used by the multiplexed counter tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
  #[serde(rename = "Number")]
  pub number: u32,
}

pub struct Peer {
  lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
  writer: WriteHalf<DuplexStream>,
}

impl Peer {
  /// Send several lines in a single write.
  pub async fn send_all<I, S>(&mut self, lines: I)
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut payload = String::new();
    for line in lines {
      payload.push_str(line.as_ref());
      payload.push('\n');
    }
    self.writer.write_all(payload.as_bytes()).await.expect("peer write");
    self.writer.flush().await.expect("peer flush");
  }

  pub async fn send(&mut self, line: &str) {
    self.send_all([line]).await;
  }

  pub async fn recv(&mut self) -> String {
    tokio::time::timeout(WAIT, self.lines.next_line())
      .await
      .expect("peer timed out waiting for a line")
      .expect("peer read")
      .expect("stream closed")
  }
}

/// A dispatcher wired to an in-memory peer.
pub fn connect(config: &Config) -> (Dispatcher, Peer) {
  let (local, remote) = tokio::io::duplex(256 * 1024);
  let (read, writer) = tokio::io::split(remote);
  let dispatcher = Dispatcher::from_stream(local, config);
  let peer = Peer {
    lines: BufReader::new(read).lines(),
    writer,
  };
  (dispatcher, peer)
}
