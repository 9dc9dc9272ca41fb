//! What a server said about itself during the handshake

use std::collections::BTreeSet;

use msg_protocol::ListingLine;
use serde::{Deserialize, Serialize};

/// Server name, published parameters and registered commands
///
/// Filled once by the `lst` handshake and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Name reported by the `server` line
    pub name: String,
    /// Parameters the server will report
    pub published: BTreeSet<String>,
    /// Commands the server accepts
    pub registered: BTreeSet<String>,
}

impl ServerCapabilities {
    /// Fold one classified listing line into the capabilities
    pub fn absorb(&mut self, line: ListingLine) {
        match line {
            ListingLine::Server(name) => self.name = name,
            ListingLine::Published(param) => {
                self.published.insert(param);
            }
            ListingLine::Registered(command) => {
                self.registered.insert(command);
            }
            ListingLine::End | ListingLine::Other(_) => {}
        }
    }

    /// Whether `param` can be read or subscribed
    pub fn is_published(&self, param: &str) -> bool {
        self.published.contains(param)
    }

    /// Whether `command` can be run
    pub fn is_registered(&self, command: &str) -> bool {
        self.registered.contains(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_listing() {
        let mut caps = ServerCapabilities::default();
        for line in [
            "server TESTSRV",
            "published bar",
            "published fizz",
            "registered multiply",
            "some banner text",
        ] {
            caps.absorb(ListingLine::classify(line));
        }

        assert_eq!(caps.name, "TESTSRV");
        assert!(caps.is_published("bar"));
        assert!(caps.is_published("fizz"));
        assert!(!caps.is_published("multiply"));
        assert!(caps.is_registered("multiply"));
        assert_eq!(caps.published.len(), 2);
    }
}
