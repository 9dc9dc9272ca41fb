//! MSG Client Library
//!
//! Async, multiplexing client for SAO MSG servers. One TCP connection is
//! shared by any number of concurrent callers:
//!
//! - **Connection**: dials the server and runs the `lst` handshake that
//!   discovers published parameters and registered commands
//! - **Multiplexer**: tags each request with a correlation ID and hands the
//!   matching `ack`/`nak` back to exactly the caller that sent it
//! - **Dispatcher**: keeps the subscription table and runs callbacks for
//!   `set` pushes on one worker task per subscription, in arrival order
//! - **Read loop**: the single task that reads the socket and routes lines
//!
//! # Example
//!
//! ```rust,no_run
//! use msg_client::{Callback, Client, ClientConfig};
//!
//! # async fn example() -> Result<(), msg_client::MsgError> {
//! let client = Client::new(ClientConfig::for_endpoint("localhost", 6868));
//! let caps = client.open().await?;
//! println!("connected to {}", caps.name);
//!
//! let bar = client.get("bar").await?;
//! client.run("multiply", [4, 5]).await?;
//!
//! client
//!     .subscribe("foo", Some(Callback::sync(|value| println!("foo = {:?}", value))))
//!     .await?;
//!
//! client.close().await;
//! # let _ = bar;
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
mod mainloop;
pub mod multiplexer;
pub mod registry;

pub use capabilities::ServerCapabilities;
pub use client::Client;
pub use config::{ClientConfig, ConfigError, DEFAULT_PORT};
pub use connection::ConnectionState;
pub use dispatcher::{Callback, Dispatcher};
pub use error::MsgError;
pub use multiplexer::Multiplexer;
pub use registry::{shared_client, Registry};
