//! Multiplexed line-oriented command transport.
//!
//! Turns one duplex byte stream to a controller process into any number of
//! ordered, backpressure-controlled command streams. Lines flow from the
//! `transport` read loop through the `buffer` into a `parser::ParserStack`,
//! where fixed grammars, JSON framers and per-stream demultiplexers turn them
//! into typed commands. `dispatcher` wires it all up for one connection.

pub mod buffer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod parser;
pub mod transport;

#[cfg(test)]
mod __tests__;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use buffer::{AcceptSignal, BackpressureBuffer};
pub use config::Config;
pub use dispatcher::{DispatchEvent, Dispatcher};
pub use error::{ConfigError, ObserverAlreadySet, ParseError, StackError, TransportError};
pub use parser::{Grammar, Parsed, Parser, ParserStack, StackEntry};
pub use transport::{LineHandler, LineWriter, Transport};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
