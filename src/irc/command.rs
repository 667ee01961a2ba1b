/// Command parsing: turns a raw line into a structured command.
///
/// Implements the RFC 2812 client-message shape:
///   [`:`prefix SPACE] verb [SPACE params] [SPACE `:` trailing]
///
/// A leading prefix is tolerated and discarded; servers identify the sender
/// by connection, not by the prefix the client claims.
use std::sync::Arc;

use super::client::Client;

/// Errors that can occur during command parsing.
///
/// Only `NotEnoughArgs` is reported back to the client; every other kind is
/// silently dropped by the read pump.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command line")]
    Empty,
    #[error("not enough parameters")]
    NotEnoughArgs,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// A parsed command, optionally tagged with the client it came from.
///
/// Synthetic commands (timeouts, connection-closed quits) are built directly
/// and enter the intake queue the same way as parsed ones.
#[derive(Debug, Clone)]
pub struct Command {
    client: Option<Arc<Client>>,
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Nick { nickname: String },
    User { username: String, mode: u8, realname: String },
    Ping { token: String },
    Pong { token: String },
    Join { channels: Vec<String> },
    Part { channels: Vec<String>, message: String },
    Privmsg { target: String, text: String },
    Quit { message: String },
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self { client: None, kind }
    }

    /// Parse a single command line (without the trailing `\r\n`).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let (verb, params) = scan(line)?;

        let kind = match verb.to_uppercase().as_str() {
            "NICK" => CommandKind::Nick {
                nickname: params.first().ok_or(ParseError::NotEnoughArgs)?.clone(),
            },
            "USER" => {
                if params.len() < 4 {
                    return Err(ParseError::NotEnoughArgs);
                }
                CommandKind::User {
                    username: params[0].clone(),
                    mode: params[1].parse().unwrap_or(0),
                    realname: params[3].clone(),
                }
            }
            "PING" => CommandKind::Ping {
                token: params.first().ok_or(ParseError::NotEnoughArgs)?.clone(),
            },
            "PONG" => CommandKind::Pong {
                token: params.first().cloned().unwrap_or_default(),
            },
            "JOIN" => CommandKind::Join {
                channels: split_targets(params.first().ok_or(ParseError::NotEnoughArgs)?),
            },
            "PART" => CommandKind::Part {
                channels: split_targets(params.first().ok_or(ParseError::NotEnoughArgs)?),
                message: params.get(1).cloned().unwrap_or_default(),
            },
            "PRIVMSG" => {
                if params.len() < 2 {
                    return Err(ParseError::NotEnoughArgs);
                }
                CommandKind::Privmsg {
                    target: params[0].clone(),
                    text: params[1].clone(),
                }
            }
            "QUIT" => CommandKind::Quit {
                message: params.first().cloned().unwrap_or_else(|| "quit".to_owned()),
            },
            other => return Err(ParseError::UnknownCommand(other.to_owned())),
        };

        Ok(Self { client: None, kind })
    }

    /// Attach the originating client. Called by the read pump before the
    /// command enters the intake queue.
    pub fn set_client(&mut self, client: Arc<Client>) {
        self.client = Some(client);
    }

    pub fn client(&self) -> Option<&Arc<Client>> {
        self.client.as_ref()
    }
}

/// Scan a line into (verb, params), handling an optional prefix and a
/// trailing `:`-parameter that may contain spaces.
fn scan(input: &str) -> Result<(&str, Vec<String>), ParseError> {
    let input = input.trim_end_matches("\r\n");

    if input.is_empty() {
        return Err(ParseError::Empty);
    }

    // Discard a claimed prefix; it runs until the first space.
    let rest = if let Some(stripped) = input.strip_prefix(':') {
        match stripped.find(' ') {
            Some(idx) => &stripped[idx + 1..],
            None => return Err(ParseError::Empty),
        }
    } else {
        input
    };

    // Split into verb and parameter portion.
    let (verb, param_str) = match rest.find(' ') {
        Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
        None => (rest, None),
    };

    if verb.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut params = Vec::new();

    if let Some(mut remaining) = param_str {
        while !remaining.is_empty() {
            if let Some(trailing) = remaining.strip_prefix(':') {
                // Trailing parameter: everything after the colon, spaces included.
                params.push(trailing.to_owned());
                break;
            }
            match remaining.find(' ') {
                Some(idx) => {
                    params.push(remaining[..idx].to_owned());
                    remaining = &remaining[idx + 1..];
                }
                None => {
                    params.push(remaining.to_owned());
                    break;
                }
            }
        }
    }

    Ok((verb, params))
}

/// Split a comma-separated target list (`JOIN #a,#b`).
fn split_targets(param: &str) -> Vec<String> {
    param
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_owned())
        .collect()
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}
