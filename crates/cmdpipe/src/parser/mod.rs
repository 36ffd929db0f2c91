//! Line parsers and their command queues.
//!
//! A `Parser<G>` wraps one `Grammar` and turns lines into queued commands.
//! Consumers either poll (`next`) once per tick or await (`next_async`) from a
//! background task. Parsers are composed through the `StackEntry` trait so a
//! `ParserStack` can hold plain parsers, nested stacks and demultiplexers
//! side by side.
//!
//! # Design Principles
//!
//! - **One grammar per parser**: grammars only decide what a line means, the
//!   parser owns queueing and signalling
//! - **Ordered**: the grammar lock is held through the enqueue, so commands are
//!   queued in the order their lines were parsed
//! - **Typed observer**: a parser may carry one observer, installed at most once,
//!   that sees every command before it is queued
//!
//! # Concurrency
//!
//! `try_parse`, `next` and `next_async` may run on different threads. The queue
//! and its "non-empty" flag change together under the queue lock, so a waiter
//! can never miss a wakeup. Only one task should await `next_async` on a given
//! parser at a time.

pub mod control;
pub mod demux;
pub mod json;
pub mod report;
pub mod stack;

use std::{
  any::Any,
  collections::VecDeque,
  fmt,
  sync::{Arc, Mutex, OnceLock},
};

use tokio::sync::watch;

pub use control::{ControlCommand, ControlGrammar};
pub use demux::{Demultiplexer, Envelope, EnvelopeGrammar, StreamId};
pub use json::{END_TOKEN, JsonBatch, JsonFramer};
pub use report::{Report, ReportGrammar};
pub use stack::ParserStack;

use crate::{
  error::{ObserverAlreadySet, ParseError},
  lock,
};

// ============================================================================
// Grammar / Stack Entry
// ============================================================================

/// Converts a single line into at most one command.
///
/// `Ok(None)` means the line was accepted but produced nothing yet (a JSON
/// fragment, for instance).
pub trait Grammar: Send + 'static {
  type Command: Send + 'static;

  fn parse_line(&mut self, line: &str) -> Result<Option<Self::Command>, ParseError>;
}

/// Outcome of a successful `try_parse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
  /// A command was queued somewhere down the chain
  Command,
  /// The line was accepted without producing a command
  Nothing,
}

impl Parsed {
  pub fn is_command(self) -> bool {
    matches!(self, Parsed::Command)
  }
}

/// Uniform interface of everything that can live on a `ParserStack`.
pub trait StackEntry: Send + Sync + 'static {
  fn try_parse(&self, line: &str) -> Result<Parsed, ParseError>;

  /// Human readable name used in stack discipline errors
  fn describe(&self) -> String;

  /// Upcast used by `ParserStack::pop_typed`
  fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// `type_name` with every module path stripped, e.g. `Parser<JsonFramer<Value>>`
pub(crate) fn short_type_name<T: ?Sized>() -> String {
  fn last_segment(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
  }

  let full = std::any::type_name::<T>();
  let mut out = String::with_capacity(full.len());
  let mut start = 0;
  for (idx, c) in full.char_indices() {
    if matches!(c, '<' | '>' | ',' | ' ' | '(' | ')' | '[' | ']' | '&' | ';') {
      out.push_str(last_segment(&full[start..idx]));
      out.push(c);
      start = idx + c.len_utf8();
    }
  }
  out.push_str(last_segment(&full[start..]));
  out
}

// ============================================================================
// Parser
// ============================================================================

type Observer<C> = Box<dyn Fn(&C) + Send + Sync>;

/// Single-grammar parser with a FIFO command queue.
pub struct Parser<G: Grammar> {
  grammar: Mutex<G>,
  queue: Mutex<VecDeque<G::Command>>,
  /// `true` exactly while the queue is non-empty
  ready: watch::Sender<bool>,
  on_parsed: OnceLock<Observer<G::Command>>,
}

impl<G: Grammar> Parser<G> {
  pub fn new(grammar: G) -> Self {
    let (ready, _) = watch::channel(false);
    Self {
      grammar: Mutex::new(grammar),
      queue: Mutex::new(VecDeque::new()),
      ready,
      on_parsed: OnceLock::new(),
    }
  }

  /// Builder form of `set_on_parsed` for parsers that are configured once at construction.
  pub fn with_on_parsed(self, observer: impl Fn(&G::Command) + Send + Sync + 'static) -> Self {
    // Cannot fail on a freshly built parser
    let _ = self.on_parsed.set(Box::new(observer));
    self
  }

  /// Install the observer called for every parsed command.
  ///
  /// The observer runs synchronously inside `try_parse`, before the command is
  /// queued, and must not parse through this same parser.
  pub fn set_on_parsed(&self, observer: impl Fn(&G::Command) + Send + Sync + 'static) -> Result<(), ObserverAlreadySet> {
    self.on_parsed.set(Box::new(observer)).map_err(|_| ObserverAlreadySet)
  }

  pub fn try_parse(&self, line: &str) -> Result<Parsed, ParseError> {
    Ok(match self.try_parse_inspect(line, |_| ())? {
      Some(()) => Parsed::Command,
      None => Parsed::Nothing,
    })
  }

  /// Parse a line, letting `inspect` look at the command before it is queued.
  pub(crate) fn try_parse_inspect<R>(
    &self,
    line: &str,
    inspect: impl FnOnce(&G::Command) -> R,
  ) -> Result<Option<R>, ParseError> {
    let mut grammar = lock(&self.grammar);
    let Some(command) = grammar.parse_line(line)? else {
      return Ok(None);
    };

    if let Some(observer) = self.on_parsed.get() {
      observer(&command);
    }
    let out = inspect(&command);

    let mut queue = lock(&self.queue);
    queue.push_back(command);
    self.ready.send_replace(true);
    Ok(Some(out))
  }

  /// Dequeue the oldest command without waiting.
  pub fn next(&self) -> Option<G::Command> {
    let mut queue = lock(&self.queue);
    let command = queue.pop_front();
    if queue.is_empty() {
      self.ready.send_replace(false);
    }
    command
  }

  /// Dequeue the oldest command, waiting for one if the queue is empty.
  pub async fn next_async(&self) -> G::Command {
    let mut ready = self.ready.subscribe();
    loop {
      if let Some(command) = self.next() {
        return command;
      }
      // The sender lives in `self`, so this only returns once the flag is set
      let _ = ready.wait_for(|non_empty| *non_empty).await;
    }
  }

  pub fn len(&self) -> usize {
    lock(&self.queue).len()
  }

  pub fn is_empty(&self) -> bool {
    lock(&self.queue).is_empty()
  }

  /// Drop every queued command.
  pub fn clear(&self) {
    let mut queue = lock(&self.queue);
    queue.clear();
    self.ready.send_replace(false);
  }
}

impl<G: Grammar + Default> Default for Parser<G> {
  fn default() -> Self {
    Self::new(G::default())
  }
}

impl<G: Grammar> fmt::Debug for Parser<G> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Parser")
      .field("grammar", &short_type_name::<G>())
      .field("queued", &self.len())
      .finish()
  }
}

impl<G: Grammar> StackEntry for Parser<G> {
  fn try_parse(&self, line: &str) -> Result<Parsed, ParseError> {
    Parser::try_parse(self, line)
  }

  fn describe(&self) -> String {
    short_type_name::<Self>()
  }

  fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
    self
  }
}
