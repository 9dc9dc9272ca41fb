//! Error types for MSG line encoding

use thiserror::Error;

/// Errors that can occur while building an outgoing line
///
/// Decoding never fails: a line that cannot be understood becomes
/// [`Message::Unrecognized`](crate::Message::Unrecognized).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Command or parameter token is empty or contains whitespace
    #[error("invalid token: {0:?}")]
    InvalidToken(String),

    /// Argument would break line framing
    #[error("invalid argument (contains a line break): {0:?}")]
    InvalidArgument(String),

    /// Correlation ID outside `1..MAXID`
    #[error("invalid correlation id: {0}")]
    InvalidId(u32),
}
