//! `lst` handshake output
//!
//! After acking `1 lst` a server describes itself with one line per item,
//! followed by a sentinel:
//!
//! ```text
//! 1 ack
//! server TESTSRV
//! published bar
//! published foo
//! registered multiply
//! ----LIST----
//! ```
//!
//! Lines are classified by their leading keyword; anything else is ignored.

use crate::Encode;

/// Sentinel that terminates the listing
pub const LIST_SENTINEL: &str = "----LIST----";

/// One classified line of `lst` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingLine {
    /// `server <name>`
    Server(String),
    /// `published <param>`
    Published(String),
    /// `registered <command>`
    Registered(String),
    /// Sentinel line
    End,
    /// Anything else (ignored by clients)
    Other(String),
}

impl ListingLine {
    /// Classify one line of handshake output
    pub fn classify(line: &str) -> ListingLine {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.contains(LIST_SENTINEL) {
            return ListingLine::End;
        }

        let mut tokens = line.split_whitespace();
        let keyword = tokens.next();
        let Some(name) = tokens.next().map(str::to_string) else {
            return ListingLine::Other(line.to_string());
        };

        match keyword {
            Some(k) if k.starts_with("server") => ListingLine::Server(name),
            Some(k) if k.starts_with("published") => ListingLine::Published(name),
            Some(k) if k.starts_with("registered") => ListingLine::Registered(name),
            _ => ListingLine::Other(line.to_string()),
        }
    }
}

impl Encode for ListingLine {
    fn encode(&self) -> Vec<u8> {
        let line = match self {
            ListingLine::Server(name) => format!("server {}", name),
            ListingLine::Published(param) => format!("published {}", param),
            ListingLine::Registered(command) => format!("registered {}", command),
            ListingLine::End => LIST_SENTINEL.to_string(),
            ListingLine::Other(raw) => raw.clone(),
        };
        format!("{}\n", line).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_keywords() {
        assert_eq!(
            ListingLine::classify("server TESTSRV\n"),
            ListingLine::Server("TESTSRV".into())
        );
        assert_eq!(
            ListingLine::classify("published bar"),
            ListingLine::Published("bar".into())
        );
        assert_eq!(
            ListingLine::classify("registered multiply extra words"),
            ListingLine::Registered("multiply".into())
        );
    }

    #[test]
    fn test_sentinel_anywhere_in_line() {
        assert_eq!(ListingLine::classify("----LIST----\n"), ListingLine::End);
        assert_eq!(ListingLine::classify("  ----LIST---- done"), ListingLine::End);
    }

    #[test]
    fn test_keyword_must_lead() {
        // A published parameter whose name mentions another keyword
        assert_eq!(
            ListingLine::classify("published server_time"),
            ListingLine::Published("server_time".into())
        );
        assert!(matches!(
            ListingLine::classify("comment about published things"),
            ListingLine::Other(_)
        ));
    }

    #[test]
    fn test_keyword_without_name_is_ignored() {
        assert_eq!(
            ListingLine::classify("published"),
            ListingLine::Other("published".into())
        );
    }

    #[test]
    fn test_encode_listing() {
        assert_eq!(ListingLine::Server("X".into()).encode(), b"server X\n");
        assert_eq!(ListingLine::End.encode(), b"----LIST----\n");
    }
}
