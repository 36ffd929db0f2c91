//! `Error:` / `Warning:` lines reported by the peer.
//!
//! The prefix is matched case-insensitively and must be followed directly by
//! a colon. The message is everything after the colon, untouched.

use std::fmt;

use super::Grammar;
use crate::error::ParseError;

/// An error or warning raised by the process on the other end of the pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
  pub is_error: bool,
  pub message: String,
}

impl fmt::Display for Report {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = if self.is_error { "Error" } else { "Warning" };
    write!(f, "{kind} from extern: {}", self.message)
  }
}

#[derive(Debug, Default)]
pub struct ReportGrammar;

impl Grammar for ReportGrammar {
  type Command = Report;

  fn parse_line(&mut self, line: &str) -> Result<Option<Report>, ParseError> {
    let parsed = line.split_once(':').and_then(|(kind, message)| {
      let is_error = if kind.eq_ignore_ascii_case("error") {
        true
      } else if kind.eq_ignore_ascii_case("warning") {
        false
      } else {
        return None;
      };
      Some(Report {
        is_error,
        message: message.to_string(),
      })
    });

    match parsed {
      Some(report) => Ok(Some(report)),
      None => Err(ParseError::mismatch(format!(
        "Could not parse line {line} as an error or warning."
      ))),
    }
  }
}
