//! Viewer protocol: one `;`-delimited command per line, one reply per line.
//!
//! ```text
//! getcpu                         -> "<average>"
//! app;<path>;<seconds>;<trigger> -> "OK" | "<error>"
//! anything else                  -> "unknown command"
//! line over MAX_LINE bytes       -> "line too long"
//! ```

use thiserror::Error;

pub const OK: &str = "OK";
pub const UNKNOWN_COMMAND: &str = "unknown command";
pub const LINE_TOO_LONG: &str = "line too long";

/// Longest accepted command line in bytes, newline included.
pub const MAX_LINE: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppArgs {
    pub path: String,
    pub duration_secs: u64,
    pub trigger_percent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetCpu,
    App(AppArgs),
    Unknown(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("app command expects app;<path>;<seconds>;<trigger>, got {0} field(s)")]
    Arity(usize),
    #[error("{field} must be a non-negative integer, got {value:?}")]
    NotInteger { field: &'static str, value: String },
}

fn integer<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, CommandError> {
    value.trim().parse().map_err(|_| CommandError::NotInteger {
        field,
        value: value.to_string(),
    })
}

/// Parses a request line. The keyword is case-insensitive; a trailing `\r` is ignored.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.split(';').collect();
    let keyword = fields[0].trim().to_ascii_lowercase();

    match keyword.as_str() {
        "getcpu" => Ok(Command::GetCpu),
        "app" => {
            if fields.len() != 4 {
                return Err(CommandError::Arity(fields.len()));
            }
            Ok(Command::App(AppArgs {
                path: fields[1].to_string(),
                duration_secs: integer("duration", fields[2])?,
                trigger_percent: integer("trigger", fields[3])?,
            }))
        }
        _ => Ok(Command::Unknown(line.to_string())),
    }
}
