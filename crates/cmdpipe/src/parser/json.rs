//! Incremental JSON object framing.
//!
//! The peer streams JSON objects as plain lines: one object may span several
//! lines, and one line may carry several objects. `JsonFramer` counts braces
//! across calls to find object boundaries and yields every object completed by
//! a line as one `JsonBatch`. A line equal to `END` closes the stream.
//!
//! Braces inside string literals are not counted. A string still open when a
//! line starting with `{` arrives is treated as unterminated: the pending
//! object is dropped with a framing error. Any text outside an object
//! is kept as part of the next object's text, so objects on one line may only
//! be separated by whitespace.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use super::Grammar;
use crate::error::ParseError;

/// Line that terminates a JSON object stream
pub const END_TOKEN: &str = "END";

/// Objects completed by one line, or the end-of-stream marker.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonBatch<T> {
  pub objects: Vec<T>,
  pub is_end: bool,
}

impl<T> JsonBatch<T> {
  pub fn end() -> Self {
    Self {
      objects: Vec::new(),
      is_end: true,
    }
  }
}

/// Brace-counting framer for a stream of `T` objects.
pub struct JsonFramer<T> {
  /// Text of the object currently being assembled
  pending: String,
  /// Open braces in `pending`
  depth: usize,
  in_string: bool,
  escaped: bool,
  _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFramer<T> {
  pub fn new() -> Self {
    Self {
      pending: String::new(),
      depth: 0,
      in_string: false,
      escaped: false,
      _marker: PhantomData,
    }
  }

  /// Current brace depth (0 between objects)
  pub fn depth(&self) -> usize {
    self.depth
  }

  /// Text carried over to the next line
  pub fn pending(&self) -> &str {
    &self.pending
  }

  pub fn reset(&mut self) {
    self.pending.clear();
    self.depth = 0;
    self.in_string = false;
    self.escaped = false;
  }
}

impl<T> Default for JsonFramer<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> std::fmt::Debug for JsonFramer<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("JsonFramer")
      .field("pending", &self.pending)
      .field("depth", &self.depth)
      .finish()
  }
}

impl<T: DeserializeOwned + Send + 'static> Grammar for JsonFramer<T> {
  type Command = JsonBatch<T>;

  fn parse_line(&mut self, line: &str) -> Result<Option<JsonBatch<T>>, ParseError> {
    if line == END_TOKEN {
      self.reset();
      return Ok(Some(JsonBatch::end()));
    }

    // A new object opening while a string is still open means that string was
    // never terminated
    if self.in_string && self.depth > 0 && line.trim_start().starts_with('{') {
      let msg = format!("Unterminated string in JSON object:\n{}", self.pending);
      self.reset();
      return Err(ParseError::framing(msg));
    }

    let mut objects = Vec::new();
    // Start of the slice of `line` not yet copied into `pending`
    let mut split = 0;

    for (idx, c) in line.char_indices() {
      if self.in_string {
        if self.escaped {
          self.escaped = false;
        } else if c == '\\' {
          self.escaped = true;
        } else if c == '"' {
          self.in_string = false;
        }
        continue;
      }

      match c {
        '"' if self.depth > 0 => self.in_string = true,
        '{' => self.depth += 1,
        '}' => {
          if self.depth == 0 {
            let msg = format!("JSON string started with closed bracket \n{}{}", self.pending, &line[split..=idx]);
            self.reset();
            return Err(ParseError::framing(msg));
          }

          self.depth -= 1;
          if self.depth == 0 {
            self.pending.push_str(&line[split..=idx]);
            split = idx + 1;
            let text = std::mem::take(&mut self.pending);

            match serde_json::from_str::<T>(text.trim()) {
              Ok(object) => objects.push(object),
              Err(e) => {
                self.reset();
                return Err(ParseError::framing(format!("Could not parse line: {e}.")));
              }
            }
          }
        }
        _ => {}
      }
    }

    self.pending.push_str(&line[split..]);

    if objects.is_empty() {
      Ok(None)
    } else {
      Ok(Some(JsonBatch {
        objects,
        is_end: false,
      }))
    }
  }
}
