//! Incoming MSG lines
//!
//! Every line a server sends decodes into exactly one [`Message`]:
//!
//! - `<id> ack[ <arg>]*` - request succeeded, arguments are the reply body
//! - `<id> nak <reason...>` - request failed
//! - `set <param> <value...>` - unsolicited update for a subscribed parameter
//!
//! Anything else is kept verbatim as [`Message::Unrecognized`].

use tracing::warn;

use crate::{Encode, ACK, NAK, SET};

/// A decoded server line
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Message {
    /// Positive reply to request `id`
    Ack {
        /// Correlation ID of the request
        id: u32,
        /// Reply tokens in wire order (possibly empty)
        args: Vec<String>,
    },
    /// Negative reply to request `id`
    Nak {
        /// Correlation ID of the request
        id: u32,
        /// Reason text, tokens joined by single spaces
        reason: String,
    },
    /// Server-initiated value update
    Push {
        /// Parameter that changed
        param: String,
        /// New value tokens
        value: Vec<String>,
    },
    /// Line that fits none of the above
    Unrecognized {
        /// The line as received, without its terminator
        raw: String,
    },
}

impl Message {
    /// Decode one line (terminator optional)
    ///
    /// Never fails; malformed input is logged and returned as
    /// [`Message::Unrecognized`].
    pub fn parse(line: &str) -> Message {
        let line = line.trim_end_matches(['\r', '\n']);
        let tokens: Vec<&str> = line.split_whitespace().collect();

        let unrecognized = || Message::Unrecognized {
            raw: line.to_string(),
        };

        let Some(first) = tokens.first() else {
            return unrecognized();
        };

        let (id, kind_at) = if first.bytes().all(|b| b.is_ascii_digit()) {
            match first.parse::<u32>() {
                Ok(id) => (Some(id), 1),
                Err(e) => {
                    warn!("Correlation id {:?} out of range: {}", first, e);
                    return unrecognized();
                }
            }
        } else {
            (None, 0)
        };

        let Some(kind) = tokens.get(kind_at) else {
            return unrecognized();
        };
        let rest = &tokens[kind_at + 1..];

        match (*kind, id) {
            (SET, _) => match rest.split_first() {
                Some((param, value)) => Message::Push {
                    param: param.to_string(),
                    value: value.iter().map(|t| t.to_string()).collect(),
                },
                None => unrecognized(),
            },
            (ACK, Some(id)) => Message::Ack {
                id,
                args: rest.iter().map(|t| t.to_string()).collect(),
            },
            (NAK, Some(id)) => Message::Nak {
                id,
                reason: rest.join(" "),
            },
            _ => unrecognized(),
        }
    }

    /// Correlation ID carried by this message, if any
    pub fn id(&self) -> Option<u32> {
        match self {
            Message::Ack { id, .. } | Message::Nak { id, .. } => Some(*id),
            Message::Push { .. } | Message::Unrecognized { .. } => None,
        }
    }

    /// Build an ack
    pub fn ack<I, S>(id: u32, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Message::Ack {
            id,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a nak
    pub fn nak(id: u32, reason: impl Into<String>) -> Self {
        Message::Nak {
            id,
            reason: reason.into(),
        }
    }

    /// Build a push
    pub fn push<I, S>(param: impl Into<String>, value: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Message::Push {
            param: param.into(),
            value: value.into_iter().map(Into::into).collect(),
        }
    }
}

impl Encode for Message {
    fn encode(&self) -> Vec<u8> {
        let line = match self {
            Message::Ack { id, args } if args.is_empty() => format!("{} {}", id, ACK),
            Message::Ack { id, args } => format!("{} {} {}", id, ACK, args.join(" ")),
            Message::Nak { id, reason } if reason.is_empty() => format!("{} {}", id, NAK),
            Message::Nak { id, reason } => format!("{} {} {}", id, NAK, reason),
            Message::Push { param, value } if value.is_empty() => format!("{} {}", SET, param),
            Message::Push { param, value } => {
                format!("{} {} {}", SET, param, value.join(" "))
            }
            Message::Unrecognized { raw } => raw.clone(),
        };
        format!("{}\n", line).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::Message;
    use crate::Encode;

    #[test]
    fn test_parse_ack_with_args() {
        let msg = Message::parse("7 ack there once was a man\n");
        assert_eq!(
            msg,
            Message::ack(7, ["there", "once", "was", "a", "man"])
        );
        assert_eq!(msg.id(), Some(7));
    }

    #[test]
    fn test_parse_bare_ack() {
        assert_eq!(
            Message::parse("12 ack"),
            Message::Ack {
                id: 12,
                args: vec![]
            }
        );
    }

    #[test]
    fn test_parse_nak_joins_reason() {
        assert_eq!(
            Message::parse("3 nak   no such   thing\r\n"),
            Message::nak(3, "no such thing")
        );
    }

    #[test]
    fn test_parse_push() {
        let msg = Message::parse("set foo 20\n");
        assert_eq!(msg, Message::push("foo", ["20"]));
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn test_parse_push_with_id_prefix() {
        assert_eq!(
            Message::parse("4 set foo 1 2"),
            Message::push("foo", ["1", "2"])
        );
    }

    #[test]
    fn test_parse_push_without_value() {
        assert_eq!(
            Message::parse("set foo"),
            Message::Push {
                param: "foo".into(),
                value: vec![]
            }
        );
    }

    #[test]
    fn test_unrecognized_lines() {
        for line in ["", "   ", "hello world", "ack 1", "5", "set", "9 frob x"] {
            assert_eq!(
                Message::parse(line),
                Message::Unrecognized {
                    raw: line.to_string()
                },
                "line {:?}",
                line
            );
        }
    }

    #[test]
    fn test_oversized_id_is_unrecognized() {
        let msg = Message::parse("99999999999999999999 ack");
        assert!(matches!(msg, Message::Unrecognized { .. }));
    }

    #[test]
    fn test_encode_replies() {
        assert_eq!(Message::ack(1, ["baz"]).encode(), b"1 ack baz\n");
        assert_eq!(Message::ack(2, Vec::<String>::new()).encode(), b"2 ack\n");
        assert_eq!(Message::nak(3, "bad value").encode(), b"3 nak bad value\n");
        assert_eq!(Message::push("foo", ["20"]).encode(), b"set foo 20\n");
    }
}
