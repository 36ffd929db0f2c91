//! Demultiplexer - routes `<id> <payload>` lines to per-stream parsers
//!
//! One physical connection carries many logical streams, one per concurrently
//! simulated agent. Each line is prefixed with its stream id; the payload is
//! handed to that stream's own parser, created on first use.
//!
//! # Design Principles
//!
//! - **Lazy**: a stream parser is built with `Default` the first time its id is seen
//! - **Isolated**: a bad payload is logged against its stream and never fails the
//!   shared line, so one broken stream cannot stall the others
//! - **Independent locking**: the id map is a `DashMap` and is never locked while
//!   a stream parser runs
//!
//! Every matched line is also queued as an `Envelope`, which tells a consumer
//! which stream just received data.

use std::{any::Any, fmt, sync::Arc};

use dashmap::DashMap;
use tracing::{debug, error};

use super::{Grammar, Parsed, Parser, StackEntry, short_type_name};
use crate::error::ParseError;

/// Pattern of a multiplexed line, quoted in mismatch errors
pub const ENVELOPE_PATTERN: &str = r"^(\d+) (.*)$";

// ============================================================================
// Envelope
// ============================================================================

/// Identifies one logical stream on a shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

impl From<u32> for StreamId {
  fn from(id: u32) -> Self {
    StreamId(id)
  }
}

/// A line addressed to one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
  pub stream: StreamId,
  pub line: String,
}

#[derive(Debug, Default)]
pub struct EnvelopeGrammar;

impl Grammar for EnvelopeGrammar {
  type Command = Envelope;

  fn parse_line(&mut self, line: &str) -> Result<Option<Envelope>, ParseError> {
    let mismatch = || {
      ParseError::mismatch(format!(
        "Could not parse line \"{line}\" as a multiplexed line. Expected line structure {ENVELOPE_PATTERN}."
      ))
    };

    let (digits, payload) = line.split_once(' ').ok_or_else(mismatch)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
      return Err(mismatch());
    }
    let id: u32 = digits.parse().map_err(|_| mismatch())?;

    Ok(Some(Envelope {
      stream: StreamId(id),
      line: payload.to_string(),
    }))
  }
}

// ============================================================================
// Demultiplexer
// ============================================================================

pub struct Demultiplexer<P> {
  envelopes: Parser<EnvelopeGrammar>,
  routes: DashMap<StreamId, Arc<P>>,
}

impl<P: StackEntry + Default> Demultiplexer<P> {
  pub fn new() -> Self {
    Self {
      envelopes: Parser::default(),
      routes: DashMap::new(),
    }
  }

  /// Get the parser for `id`, creating it if this is the first reference.
  pub fn parser_for(&self, id: StreamId) -> Arc<P> {
    let entry = self.routes.entry(id).or_insert_with(|| {
      debug!(stream = %id, "Creating stream parser");
      Arc::new(P::default())
    });
    Arc::clone(entry.value())
  }

  /// Forget the parser for `id`. Handles already held by callers stay usable.
  pub fn remove(&self, id: StreamId) -> Option<Arc<P>> {
    self.routes.remove(&id).map(|(_, parser)| parser)
  }

  pub fn contains(&self, id: StreamId) -> bool {
    self.routes.contains_key(&id)
  }

  /// Ids with a live parser, in ascending order
  pub fn streams(&self) -> Vec<StreamId> {
    let mut ids: Vec<StreamId> = self.routes.iter().map(|entry| *entry.key()).collect();
    ids.sort_unstable();
    ids
  }

  pub fn len(&self) -> usize {
    self.routes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.routes.is_empty()
  }

  /// Oldest routed envelope not yet taken
  pub fn next_envelope(&self) -> Option<Envelope> {
    self.envelopes.next()
  }

  pub async fn next_envelope_async(&self) -> Envelope {
    self.envelopes.next_async().await
  }

  fn route(&self, envelope: &Envelope) -> Parsed {
    let parser = self.parser_for(envelope.stream);
    match parser.try_parse(&envelope.line) {
      Ok(parsed) => parsed,
      Err(e) => {
        error!(
          stream = %envelope.stream,
          "Could not parse multiplexed line:\n\t{}",
          e.to_string().replace('\n', "\n\t")
        );
        Parsed::Nothing
      }
    }
  }
}

impl<P: StackEntry + Default> Default for Demultiplexer<P> {
  fn default() -> Self {
    Self::new()
  }
}

impl<P> fmt::Debug for Demultiplexer<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Demultiplexer")
      .field("streams", &self.routes.len())
      .field("envelopes", &self.envelopes.len())
      .finish()
  }
}

impl<P: StackEntry + Default> StackEntry for Demultiplexer<P> {
  /// Accepts any well-formed envelope. The outcome reports whether the stream
  /// parser queued a command, so a consumer knows when to expect one.
  fn try_parse(&self, line: &str) -> Result<Parsed, ParseError> {
    let routed = self.envelopes.try_parse_inspect(line, |envelope| self.route(envelope))?;
    Ok(routed.unwrap_or(Parsed::Nothing))
  }

  fn describe(&self) -> String {
    short_type_name::<Self>()
  }

  fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
    self
  }
}
