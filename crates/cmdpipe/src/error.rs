//! Error types shared across the transport and parser layers.
//!
//! Parse-time failures (`ParseError`) are ordinary input errors: they are
//! aggregated by the parser stack and reported back to the peer, never
//! propagated past it. `StackError` is a caller bug. `TransportError` covers
//! the byte stream itself.

use std::{path::PathBuf, time::Duration};

use tokio_util::codec::LinesCodecError;

// ============================================================================
// Parse Errors
// ============================================================================

/// A line could not be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
  /// The line does not match this parser's grammar.
  #[error("{0}")]
  Mismatch(String),

  /// The line matched, but its framing or payload is broken.
  #[error("{0}")]
  Framing(String),

  /// Every entry of a parser stack rejected the line.
  #[error("Could not be parsed by any of the {tried} parsers.\nError Messages:\n{}", .messages.join("\n"))]
  Unparsed { tried: usize, messages: Vec<String> },
}

impl ParseError {
  pub fn mismatch(msg: impl Into<String>) -> Self {
    ParseError::Mismatch(msg.into())
  }

  pub fn framing(msg: impl Into<String>) -> Self {
    ParseError::Framing(msg.into())
  }
}

// ============================================================================
// Stack Errors
// ============================================================================

/// Push/pop discipline was violated on a `ParserStack`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
  #[error("Tried to pop parser from parser stack, but the stack is empty.")]
  Empty,

  #[error("Tried to pop parser from parser stack, but did not match.\nParser at end of stack: {top}\nPassed parser: {passed}")]
  Mismatch { top: String, passed: String },

  #[error(
    "Tried to pop parser from parser stack, but type did not match.\nParser at end of stack: {top}\nPassed parser type: {expected}"
  )]
  TypeMismatch { top: String, expected: String },
}

/// The one-shot parse observer of a `Parser` was already installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Parse observer has already been set")]
pub struct ObserverAlreadySet;

// ============================================================================
// Transport Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Codec error: {0}")]
  Codec(#[from] LinesCodecError),

  #[error("Timed out after {timeout:?} connecting to {path:?}")]
  ConnectTimeout { path: PathBuf, timeout: Duration },

  #[error("Transport is closed")]
  Closed,
}

// ============================================================================
// Config Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config {path:?}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Invalid config {path:?}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
}
