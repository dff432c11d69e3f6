//! Line commands typed at the prompt.

use std::path::PathBuf;

use client_core::StartConfig;
use serde_json::{Map, Value};
use shared::domain::RecordKind;
use thiserror::Error;

pub const USAGE: &str = "\
commands:
  /start role <role>          start a session for a role
  /start org <id>             start a session for an organization
  /upload <path>              upload a roster or schedule file
  /confirm | /decline         answer a schedule proposal
  /refresh                    poll project creation progress
  /add <kind> key=value ...   add an instructor, course or student
  /edit <index> key=value ... change a record (key=null removes the field)
  /remove <index>             remove a record
  /save                       send unsaved record changes
  /info                       show session info
  /end                        end the session on the server
  /reset                      forget the local session
  /help                       show this text
  /quit                       exit
anything else is sent as a chat message";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start(StartConfig),
    Upload(PathBuf),
    Confirm,
    Decline,
    Refresh,
    Add {
        record: RecordKind,
        fields: Map<String, Value>,
    },
    Edit {
        index: usize,
        fields: Map<String, Value>,
    },
    Remove {
        index: usize,
    },
    Save,
    Info,
    End,
    Reset,
    Help,
    Quit,
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty input")]
    Empty,
    #[error("unknown command '/{0}', try /help")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("'{0}' is not a record index")]
    BadIndex(String),
    #[error("expected key=value, got '{0}'")]
    BadField(String),
    #[error("{0}")]
    BadRecordKind(String),
}

pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Message(line.to_string()));
    };

    let args = split_args(rest);
    let Some((name, args)) = args.split_first() else {
        return Err(ParseError::UnknownCommand(String::new()));
    };
    match (name.as_str(), args) {
        ("start", [scope, value]) if scope == "role" => {
            Ok(Command::Start(StartConfig::Role(value.clone())))
        }
        ("start", [scope, value]) if scope == "org" => {
            Ok(Command::Start(StartConfig::Organization(value.clone())))
        }
        ("start", _) => Err(ParseError::Usage("/start role <role> | /start org <id>")),
        ("upload", [path]) => Ok(Command::Upload(PathBuf::from(path))),
        ("upload", _) => Err(ParseError::Usage("/upload <path>")),
        ("confirm", []) => Ok(Command::Confirm),
        ("confirm", _) => Err(ParseError::Usage("/confirm takes no arguments")),
        ("decline", []) => Ok(Command::Decline),
        ("decline", _) => Err(ParseError::Usage("/decline takes no arguments")),
        ("refresh", []) => Ok(Command::Refresh),
        ("refresh", _) => Err(ParseError::Usage("/refresh takes no arguments")),
        ("add", [kind, pairs @ ..]) if !pairs.is_empty() => Ok(Command::Add {
            record: kind.parse().map_err(ParseError::BadRecordKind)?,
            fields: parse_fields(pairs)?,
        }),
        ("add", _) => Err(ParseError::Usage("/add <instructor|course|student> key=value ...")),
        ("edit", [index, pairs @ ..]) if !pairs.is_empty() => Ok(Command::Edit {
            index: parse_index(index)?,
            fields: parse_fields(pairs)?,
        }),
        ("edit", _) => Err(ParseError::Usage("/edit <index> key=value ...")),
        ("remove", [index]) => Ok(Command::Remove {
            index: parse_index(index)?,
        }),
        ("remove", _) => Err(ParseError::Usage("/remove <index>")),
        ("save", []) => Ok(Command::Save),
        ("save", _) => Err(ParseError::Usage("/save takes no arguments")),
        ("info", []) => Ok(Command::Info),
        ("info", _) => Err(ParseError::Usage("/info takes no arguments")),
        ("end", []) => Ok(Command::End),
        ("end", _) => Err(ParseError::Usage("/end takes no arguments")),
        ("reset", []) => Ok(Command::Reset),
        ("reset", _) => Err(ParseError::Usage("/reset takes no arguments")),
        ("help", _) => Ok(Command::Help),
        ("quit" | "exit", _) => Ok(Command::Quit),
        (other, _) => Err(ParseError::UnknownCommand(other.to_string())),
    }
}

fn parse_index(raw: &str) -> Result<usize, ParseError> {
    raw.parse()
        .map_err(|_| ParseError::BadIndex(raw.to_string()))
}

/// `key=value` pairs. Values that parse as JSON keep their type, so
/// `year=2` is a number and `email=null` clears a field; anything else is a
/// plain string.
fn parse_fields(pairs: &[String]) -> Result<Map<String, Value>, ParseError> {
    let mut fields = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(ParseError::BadField(pair.clone()));
        };
        if key.is_empty() {
            return Err(ParseError::BadField(pair.clone()));
        }
        let value = serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

/// Whitespace split that keeps double-quoted runs together. Quotes stay in
/// the token so quoted values still parse as JSON strings.
fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in input.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}
