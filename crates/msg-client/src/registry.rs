//! Process-wide client registry
//!
//! Independent consumers that talk to the same `(host, port)` share one
//! [`Client`] and therefore one socket and one subscription table. The global
//! registry is created on first use and never torn down; code that needs an
//! isolated connection constructs a [`Client`] directly.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::debug;

use crate::client::Client;
use crate::config::ClientConfig;

static GLOBAL: OnceLock<Registry> = OnceLock::new();

type Endpoint = (String, u16);

/// Map from endpoint to its shared client
#[derive(Debug, Default)]
pub struct Registry {
    clients: Mutex<HashMap<Endpoint, Client>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::new)
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<Endpoint, Client>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Client for `host:port`, created with default settings on first lookup
    pub fn client(&self, host: &str, port: u16) -> Client {
        self.client_with(ClientConfig::for_endpoint(host, port))
    }

    /// Client for the endpoint in `config`
    ///
    /// `config` is only used when the endpoint is new; later lookups return
    /// the existing client unchanged.
    pub fn client_with(&self, config: ClientConfig) -> Client {
        let key = (config.host.clone(), config.port);
        self.clients()
            .entry(key)
            .or_insert_with(|| {
                debug!("Registering client for {}", config.addr());
                Client::new(config)
            })
            .clone()
    }

    /// Existing client for `host:port`, if any
    pub fn get(&self, host: &str, port: u16) -> Option<Client> {
        self.clients().get(&(host.to_string(), port)).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }
}

/// Shared client for `host:port` from the global registry
pub fn shared_client(host: &str, port: u16) -> Client {
    Registry::global().client(host, port)
}
