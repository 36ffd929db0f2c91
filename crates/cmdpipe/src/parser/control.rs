//! Top-level control commands sent by the controller.
//!
//! ```text
//! run <experiment>
//! set <name> <value...>
//! quit
//! ```

use super::Grammar;
use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
  /// Start the named experiment
  Run { experiment: String },
  /// Change a runtime setting
  Set { name: String, value: String },
  /// Shut the connection down
  Quit,
}

#[derive(Debug, Default)]
pub struct ControlGrammar;

/// Split off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
  let s = s.trim_start();
  match s.find(char::is_whitespace) {
    Some(idx) => (&s[..idx], s[idx..].trim_start()),
    None => (s, ""),
  }
}

impl Grammar for ControlGrammar {
  type Command = ControlCommand;

  fn parse_line(&mut self, line: &str) -> Result<Option<ControlCommand>, ParseError> {
    let (command, rest) = split_word(line);

    match command {
      "run" => {
        let (experiment, _) = split_word(rest);
        if experiment.is_empty() {
          return Err(ParseError::mismatch("Run command requires an experiment name."));
        }
        Ok(Some(ControlCommand::Run {
          experiment: experiment.to_string(),
        }))
      }
      "set" => {
        let (name, value) = split_word(rest);
        let value = value.trim_end();
        if name.is_empty() || value.is_empty() {
          return Err(ParseError::mismatch("Set command requires a setting name and a value."));
        }
        Ok(Some(ControlCommand::Set {
          name: name.to_string(),
          value: value.to_string(),
        }))
      }
      // Trailing words are ignored
      "quit" => Ok(Some(ControlCommand::Quit)),
      _ => Err(ParseError::mismatch(format!("Could not recognize command \"{line}\"."))),
    }
  }
}
