//! MSG Server Simulation Library
//!
//! This crate provides a simulation layer for testing MSG clients without a
//! real instrument server. It includes:
//!
//! - **VirtualServer**: Answers `lst`/`get`/`sub`/`uns` and a few registered
//!   commands with protocol-accurate lines
//! - **run_virtual_server_task**: Drives a VirtualServer over any async stream
//! - **spawn_tcp_server**: Serves VirtualServers on a loopback TCP port
//!
//! # Example
//!
//! ```rust
//! use msg_sim::{VirtualServer, VirtualServerConfig};
//!
//! let mut server = VirtualServer::from_config(VirtualServerConfig::default());
//!
//! let response = server.process_line("2 get bar");
//! assert_eq!(response.lines, vec![b"2 ack baz\n".to_vec()]);
//!
//! server.process_line("3 sub foo");
//! server.process_line("4 multiply 4 5");
//! assert_eq!(server.take_output(), Some(b"set foo 20\n".to_vec()));
//! ```

pub mod server;
pub mod server_task;

pub use server::{
    Response, VirtualServer, VirtualServerConfig, DELAY, MULTIPLY, PRODUCT_PARAM,
};
pub use server_task::{
    run_virtual_server_task, spawn_tcp_server, spawn_tcp_server_on, VirtualServerCommand,
    VirtualServerHandle,
};
