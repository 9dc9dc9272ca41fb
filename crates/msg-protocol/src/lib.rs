//! MSG Protocol Library
//!
//! This crate provides parsing and encoding for the SAO MSG protocol, a
//! newline-delimited ASCII protocol with ID-correlated requests and
//! unsolicited server pushes:
//!
//! - **Requests**: `<id> <command>[ <arg>]*`
//! - **Replies**: `<id> ack[ <arg>]*` or `<id> nak <reason...>`
//! - **Pushes**: `set <param> <value...>` (no ID)
//! - **Handshake**: `1 lst`, answered by an ack, a listing and `----LIST----`
//!
//! # Architecture
//!
//! The crate does no I/O and holds no connection state:
//! - [`LineCodec`] turns a byte stream into complete lines
//! - [`Message`] decodes one line into a tagged variant
//! - [`Request`] builds validated outgoing lines
//! - [`ListingLine`] classifies handshake output
//!
//! # Example
//!
//! ```rust
//! use msg_protocol::{Encode, LineCodec, Message, Request};
//!
//! let req = Request::new(2, "multiply", [4, 5]).unwrap();
//! assert_eq!(req.encode(), b"2 multiply 4 5\n");
//!
//! let mut codec = LineCodec::new();
//! codec.push_bytes(b"2 ack\nset foo 20\n");
//! assert_eq!(codec.next_message(), Some(Message::ack(2, Vec::<String>::new())));
//! assert_eq!(codec.next_message(), Some(Message::push("foo", ["20"])));
//! ```

pub mod codec;
pub mod error;
pub mod listing;
pub mod message;
pub mod request;

pub use codec::{LineCodec, MAX_LINE_LEN};
pub use error::ProtocolError;
pub use listing::{ListingLine, LIST_SENTINEL};
pub use message::Message;
pub use request::{validate_token, Request};

/// Correlation IDs live in `1..MAXID` and wrap back to 1
pub const MAXID: u32 = 100_000;

/// Reply type token for success
pub const ACK: &str = "ack";
/// Reply type token for failure
pub const NAK: &str = "nak";
/// Type token of server pushes
pub const SET: &str = "set";
/// Read a published parameter
pub const GET: &str = "get";
/// Subscribe to a published parameter
pub const SUB: &str = "sub";
/// Cancel a subscription
pub const UNS: &str = "uns";
/// List server name, published parameters and registered commands
pub const LST: &str = "lst";

/// Trait for values that can be written as one protocol line
pub trait Encode {
    /// Encode this value to its wire format, terminator included
    fn encode(&self) -> Vec<u8>;
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn token() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_.:+-]{1,12}"
    }

    proptest! {
        #[test]
        fn parse_never_panics(line in "\\PC{0,80}") {
            let _ = Message::parse(&line);
        }

        #[test]
        fn request_tokens_survive_encoding(
            id in 1u32..MAXID,
            command in token(),
            args in prop::collection::vec(token(), 0..6),
        ) {
            let req = Request::new(id, command.clone(), args.clone()).unwrap();
            let line = String::from_utf8(req.encode()).unwrap();
            prop_assert!(line.ends_with('\n'));

            let tokens: Vec<&str> = line.split_whitespace().collect();
            prop_assert_eq!(tokens[0].parse::<u32>().unwrap(), id);
            prop_assert_eq!(tokens[1], command.as_str());
            let expected_args = args.iter().map(String::as_str).collect::<Vec<_>>();
            prop_assert_eq!(&tokens[2..], expected_args.as_slice());
        }
    }
}
