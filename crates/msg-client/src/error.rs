//! Error types for the MSG client

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to an MSG server
#[derive(Debug, Error)]
pub enum MsgError {
    /// Transport could not be established
    #[error("failed to connect to MSG server at {addr}: {source}")]
    Connect {
        /// `host:port` that was dialled
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Server did not follow the handshake protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation attempted while the connection is closed
    #[error("not connected to an MSG server")]
    NotConnected,

    /// Read loop was stopped; replies can no longer be received
    #[error("read loop is stopped")]
    Stopped,

    /// Parameter is not in the server's published set
    #[error("{param} not published by MSG server {server}")]
    UnknownParameter {
        /// Requested parameter
        param: String,
        /// Server name from the handshake
        server: String,
    },

    /// Command is not in the server's registered set
    #[error("{command} not registered by MSG server {server}")]
    UnknownCommand {
        /// Requested command
        command: String,
        /// Server name from the handshake
        server: String,
    },

    /// Server answered with `nak`
    #[error("{command} failed: {reason}")]
    Command {
        /// Command that failed
        command: String,
        /// Reason text sent by the server
        reason: String,
    },

    /// No reply within the caller's bound
    #[error("{command} timed out after {after:?}")]
    Timeout {
        /// Command that timed out
        command: String,
        /// Bound that was exceeded
        after: Duration,
    },

    /// Connection closed before the reply arrived
    #[error("connection to MSG server closed")]
    ConnectionClosed,

    /// Every correlation ID is in flight
    #[error("no free correlation id ({0} requests in flight)")]
    TooManyPending(usize),

    /// Request could not be encoded
    #[error("encoding error: {0}")]
    Encode(#[from] msg_protocol::ProtocolError),

    /// I/O error on the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MsgError {
    /// Whether reopening the connection may make the operation succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MsgError::Connect { .. }
                | MsgError::NotConnected
                | MsgError::Stopped
                | MsgError::ConnectionClosed
                | MsgError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_server() {
        let err = MsgError::UnknownParameter {
            param: "qux".into(),
            server: "TESTSRV".into(),
        };
        assert_eq!(err.to_string(), "qux not published by MSG server TESTSRV");

        let err = MsgError::Command {
            command: "multiply".into(),
            reason: "bad args".into(),
        };
        assert_eq!(err.to_string(), "multiply failed: bad args");
    }

    #[test]
    fn test_retryable() {
        assert!(MsgError::ConnectionClosed.is_retryable());
        assert!(MsgError::NotConnected.is_retryable());
        assert!(!MsgError::Protocol("x".into()).is_retryable());
        assert!(!MsgError::Timeout {
            command: "get".into(),
            after: Duration::from_secs(1)
        }
        .is_retryable());
    }
}
