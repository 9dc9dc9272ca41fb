//! Virtual MSG server
//!
//! A protocol-accurate MSG server state machine. It owns a set of published
//! values and registered commands, answers request lines and queues `set`
//! pushes for subscribed parameters when values change.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use msg_protocol::{Encode, ListingLine, Message, GET, LST, SUB, UNS};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Registered command that multiplies its two arguments into `foo`
pub const MULTIPLY: &str = "multiply";

/// Registered command that acks its remaining arguments after a delay in ms
pub const DELAY: &str = "delay";

/// Parameter written by [`MULTIPLY`]
pub const PRODUCT_PARAM: &str = "foo";

/// Configuration for creating a virtual server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualServerConfig {
    /// Name reported in the `lst` listing
    pub name: String,
    /// Published parameters and their initial values (space separated tokens)
    pub published: BTreeMap<String, String>,
    /// Registered command names
    pub registered: BTreeSet<String>,
}

impl Default for VirtualServerConfig {
    fn default() -> Self {
        let published = [
            ("bar", "baz"),
            ("bazz", "there once was a man"),
            ("fizz", ""),
            (PRODUCT_PARAM, ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            name: "TESTSRV".to_string(),
            published,
            registered: [MULTIPLY, DELAY].into_iter().map(String::from).collect(),
        }
    }
}

/// Lines produced in answer to one request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    /// Encoded lines, written in order
    pub lines: Vec<Vec<u8>>,
    /// How long to hold the lines before writing them
    pub delay: Duration,
}

impl Response {
    fn now(lines: Vec<Vec<u8>>) -> Self {
        Self {
            lines,
            delay: Duration::ZERO,
        }
    }

    fn single(msg: Message) -> Self {
        Self::now(vec![msg.encode()])
    }
}

/// A simulated MSG server
#[derive(Debug)]
pub struct VirtualServer {
    name: String,
    values: BTreeMap<String, String>,
    registered: BTreeSet<String>,
    subscribed: BTreeSet<String>,
    /// Pending push lines (protocol-encoded)
    pending_output: VecDeque<Vec<u8>>,
}

impl VirtualServer {
    /// Create a virtual server from configuration
    pub fn from_config(config: VirtualServerConfig) -> Self {
        Self {
            name: config.name,
            values: config.published,
            registered: config.registered,
            subscribed: BTreeSet::new(),
            pending_output: VecDeque::new(),
        }
    }

    /// Server name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value of a published parameter
    pub fn value(&self, param: &str) -> Option<&str> {
        self.values.get(param).map(String::as_str)
    }

    /// Whether a client subscribed to `param`
    pub fn is_subscribed(&self, param: &str) -> bool {
        self.subscribed.contains(param)
    }

    /// Set a value, publishing it (creating it if needed) and queueing a push
    /// when it is subscribed
    pub fn set_value(&mut self, param: &str, value: &str) {
        self.values.insert(param.to_string(), value.to_string());
        if self.subscribed.contains(param) {
            self.pending_output
                .push_back(Message::push(param, value.split_whitespace()).encode());
        }
    }

    /// Take the next queued push line
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        self.pending_output.pop_front()
    }

    /// Answer one request line
    pub fn process_line(&mut self, line: &str) -> Response {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (id, command, args) = match tokens.as_slice() {
            [id, command, args @ ..] => match id.parse::<u32>() {
                Ok(id) => (id, *command, args),
                Err(_) => {
                    warn!("Virtual server {} ignoring line without id: {:?}", self.name, line);
                    return Response::default();
                }
            },
            _ => {
                warn!("Virtual server {} ignoring short line: {:?}", self.name, line);
                return Response::default();
            }
        };

        debug!("Virtual server {} handling {} {:?}", self.name, command, args);

        match command {
            LST => self.list(id),
            GET => match args.first() {
                Some(param) => match self.values.get(*param) {
                    Some(value) => Response::single(Message::ack(id, value.split_whitespace())),
                    None => Response::single(Message::nak(id, format!("{} not published", param))),
                },
                None => Response::single(Message::nak(id, "get needs a parameter")),
            },
            SUB => match args.first() {
                Some(param) if self.values.contains_key(*param) => {
                    self.subscribed.insert(param.to_string());
                    let value = self.value(param).unwrap_or_default();
                    Response::single(Message::ack(id, value.split_whitespace()))
                }
                Some(param) => {
                    Response::single(Message::nak(id, format!("{} not published", param)))
                }
                None => Response::single(Message::nak(id, "sub needs a parameter")),
            },
            UNS => {
                if let Some(param) = args.first() {
                    self.subscribed.remove(*param);
                }
                Response::single(Message::ack(id, Vec::<String>::new()))
            }
            cmd if self.registered.contains(cmd) => self.run_registered(id, cmd, args),
            cmd => Response::single(Message::nak(id, format!("{} not registered", cmd))),
        }
    }

    fn list(&self, id: u32) -> Response {
        let mut lines = vec![Message::ack(id, Vec::<String>::new()).encode()];
        lines.push(ListingLine::Server(self.name.clone()).encode());
        lines.extend(
            self.values
                .keys()
                .map(|p| ListingLine::Published(p.clone()).encode()),
        );
        lines.extend(
            self.registered
                .iter()
                .map(|c| ListingLine::Registered(c.clone()).encode()),
        );
        lines.push(ListingLine::End.encode());
        Response::now(lines)
    }

    fn run_registered(&mut self, id: u32, command: &str, args: &[&str]) -> Response {
        match command {
            MULTIPLY => {
                let factors: Result<Vec<f64>, _> = args.iter().map(|a| a.parse::<f64>()).collect();
                match factors.as_deref() {
                    Ok([a, b]) => {
                        let product = a * b;
                        let text = if product.fract() == 0.0 && product.abs() < 1e15 {
                            format!("{}", product as i64)
                        } else {
                            format!("{}", product)
                        };
                        self.set_value(PRODUCT_PARAM, &text);
                        Response::single(Message::ack(id, Vec::<String>::new()))
                    }
                    _ => Response::single(Message::nak(id, "multiply needs two numbers")),
                }
            }
            DELAY => match args.split_first() {
                Some((ms, rest)) => match ms.parse::<u64>() {
                    Ok(ms) => Response {
                        lines: vec![Message::ack(id, rest.iter().copied()).encode()],
                        delay: Duration::from_millis(ms),
                    },
                    Err(_) => Response::single(Message::nak(id, format!("bad delay {}", ms))),
                },
                None => Response::single(Message::nak(id, "delay needs milliseconds")),
            },
            _ => Response::single(Message::ack(id, Vec::<String>::new())),
        }
    }
}
