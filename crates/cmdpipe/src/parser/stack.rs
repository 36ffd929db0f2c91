//! ParserStack - first-match chain of parsers
//!
//! Lines are offered to every entry in insertion order and the first entry
//! that accepts the line wins. Fixed grammars (control commands, error
//! reports) are added first so that only unrecognised or payload lines fall
//! through to the looser streaming grammars pushed later.
//!
//! Entries pushed for a transient purpose (one JSON object stream, say) must
//! be popped by their owner in reverse push order. A pop that does not match
//! the tail is a bug in the caller: it is logged, returned as a `StackError`,
//! and the stack is left as it was.

use std::{
  any::Any,
  fmt,
  sync::{Arc, Mutex},
};

use tracing::{debug, error, trace};

use super::{Parsed, StackEntry, lock, short_type_name};
use crate::error::{ParseError, StackError};

#[derive(Default)]
pub struct ParserStack {
  entries: Mutex<Vec<Arc<dyn StackEntry>>>,
}

impl ParserStack {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append an entry to the tail.
  pub fn add(&self, entry: Arc<dyn StackEntry>) {
    trace!(entry = %entry.describe(), "Pushing parser");
    lock(&self.entries).push(entry);
  }

  /// Construct a default `T`, append it, and hand back a typed handle.
  pub fn add_new<T: StackEntry + Default>(&self) -> Arc<T> {
    let entry = Arc::new(T::default());
    self.add(Arc::clone(&entry) as Arc<dyn StackEntry>);
    entry
  }

  /// Remove `entry`, which must be the current tail.
  pub fn pop<T: StackEntry + ?Sized>(&self, entry: &Arc<T>) -> Result<(), StackError> {
    let mut entries = lock(&self.entries);
    let Some(top) = entries.last() else {
      error!("Pop on empty parser stack");
      return Err(StackError::Empty);
    };

    if Arc::as_ptr(top).cast::<()>() != Arc::as_ptr(entry).cast::<()>() {
      let err = StackError::Mismatch {
        top: top.describe(),
        passed: entry.describe(),
      };
      error!("{}", err);
      return Err(err);
    }

    entries.pop();
    trace!(entry = %entry.describe(), "Popped parser");
    Ok(())
  }

  /// Remove the tail, which must be a `T`, and return it.
  pub fn pop_typed<T: StackEntry>(&self) -> Result<Arc<T>, StackError> {
    let mut entries = lock(&self.entries);
    let Some(top) = entries.last() else {
      error!("Pop on empty parser stack");
      return Err(StackError::Empty);
    };

    let any: Arc<dyn Any + Send + Sync> = Arc::clone(top).into_any();
    match any.downcast::<T>() {
      Ok(typed) => {
        entries.pop();
        Ok(typed)
      }
      Err(_) => {
        let err = StackError::TypeMismatch {
          top: top.describe(),
          expected: short_type_name::<T>(),
        };
        error!("{}", err);
        Err(err)
      }
    }
  }

  pub fn len(&self) -> usize {
    lock(&self.entries).len()
  }

  pub fn is_empty(&self) -> bool {
    lock(&self.entries).is_empty()
  }

  /// Offer `line` to each entry until one accepts it.
  ///
  /// The stack lock is held for the whole pass, so pushes and pops from other
  /// threads land between lines, never in the middle of one. Entries must not
  /// call back into the stack that owns them.
  pub fn try_parse(&self, line: &str) -> Result<Parsed, ParseError> {
    let entries = lock(&self.entries);
    let mut messages = Vec::new();

    for entry in entries.iter() {
      match entry.try_parse(line) {
        Ok(parsed) => {
          debug!(entry = %entry.describe(), ?parsed, "Line accepted");
          return Ok(parsed);
        }
        Err(e) => messages.push(e.to_string()),
      }
    }

    Err(ParseError::Unparsed {
      tried: entries.len(),
      messages,
    })
  }
}

impl fmt::Debug for ParserStack {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let entries: Vec<String> = lock(&self.entries).iter().map(|e| e.describe()).collect();
    f.debug_struct("ParserStack").field("entries", &entries).finish()
  }
}

impl StackEntry for ParserStack {
  fn try_parse(&self, line: &str) -> Result<Parsed, ParseError> {
    ParserStack::try_parse(self, line)
  }

  fn describe(&self) -> String {
    format!("ParserStack({} entries)", self.len())
  }

  fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
    self
  }
}
