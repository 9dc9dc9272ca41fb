//! Outgoing MSG requests
//!
//! # Format
//! - `<id> <command>[ <arg>]*\n`
//! - A command with no arguments is still terminated: `5 lst\n`
//! - Arguments are written with their `Display` form, joined by single spaces

use std::fmt;

use crate::error::ProtocolError;
use crate::{Encode, GET, LST, MAXID, SUB, UNS};

/// A request line ready to be written to a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    id: u32,
    command: String,
    args: Vec<String>,
}

impl Request {
    /// Create a request, validating the ID, the command token and every argument
    pub fn new<I, A>(id: u32, command: impl Into<String>, args: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = A>,
        A: fmt::Display,
    {
        if id == 0 || id >= MAXID {
            return Err(ProtocolError::InvalidId(id));
        }

        let command = command.into();
        validate_token(&command)?;

        let args = args
            .into_iter()
            .map(|a| {
                let a = a.to_string();
                if a.contains(['\n', '\r']) {
                    Err(ProtocolError::InvalidArgument(a))
                } else {
                    Ok(a)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { id, command, args })
    }

    /// `<id> get <param>`
    pub fn get(id: u32, param: &str) -> Result<Self, ProtocolError> {
        validate_token(param)?;
        Self::new(id, GET, [param])
    }

    /// `<id> sub <param>`
    pub fn subscribe(id: u32, param: &str) -> Result<Self, ProtocolError> {
        validate_token(param)?;
        Self::new(id, SUB, [param])
    }

    /// `<id> uns <param>`
    pub fn unsubscribe(id: u32, param: &str) -> Result<Self, ProtocolError> {
        validate_token(param)?;
        Self::new(id, UNS, [param])
    }

    /// `<id> lst`
    pub fn list(id: u32) -> Result<Self, ProtocolError> {
        Self::new(id, LST, std::iter::empty::<&str>())
    }

    /// Correlation ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Command token
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Arguments in wire order
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.command)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

impl Encode for Request {
    fn encode(&self) -> Vec<u8> {
        format!("{}\n", self).into_bytes()
    }
}

/// Check that `token` is a single non-empty word
pub fn validate_token(token: &str) -> Result<(), ProtocolError> {
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(ProtocolError::InvalidToken(token.to_string()));
    }
    Ok(())
}
