//! MSG client handle
//!
//! [`Client`] ties the pieces together: it opens the transport, runs the
//! handshake, starts the read loop and exposes `get`/`run`/`subscribe` to any
//! number of concurrent callers. Clones share one connection.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use msg_protocol::{validate_token, Encode, LineCodec, Request, GET};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capabilities::ServerCapabilities;
use crate::config::ClientConfig;
use crate::connection::{connect_tcp, handshake, ConnectionState, LineWriter};
use crate::dispatcher::{Callback, Dispatcher};
use crate::error::MsgError;
use crate::mainloop::{run_read_loop, LoopExit};
use crate::multiplexer::{Multiplexer, PendingGuard, Reply, Waiter};

struct LoopControl {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<LoopExit>,
}

/// State shared by every clone of a [`Client`] and its read loop
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) writer: LineWriter,
    pub(crate) mux: Multiplexer,
    pub(crate) dispatcher: Dispatcher,
    caps: Mutex<ServerCapabilities>,
    control: Mutex<Option<LoopControl>>,
    /// Serializes open/close/stop
    lifecycle: tokio::sync::Mutex<()>,
}

impl Shared {
    fn caps(&self) -> MutexGuard<'_, ServerCapabilities> {
        self.caps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self) -> MutexGuard<'_, Option<LoopControl>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Async client for one MSG server
///
/// Cheap to clone; every clone talks over the same connection and sees the
/// same subscriptions. Dropping the last handle does not close the
/// connection, call [`close`](Self::close) for that.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.shared.config.addr())
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Client {
    /// Create a closed client; nothing is dialled until [`open`](Self::open)
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            shared: Arc::new(Shared {
                config,
                state,
                writer: LineWriter::new(),
                mux: Multiplexer::new(),
                dispatcher: Dispatcher::new(),
                caps: Mutex::new(ServerCapabilities::default()),
                control: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Client for `host:port` with default settings
    pub fn connect_to(host: impl Into<String>, port: u16) -> Self {
        Self::new(ClientConfig::for_endpoint(host, port))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Whether two handles share one connection
    pub fn ptr_eq(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Dial the configured endpoint, handshake and start the read loop
    ///
    /// Returns the cached capabilities if already open. On failure the
    /// client stays `Closed` and `open` may be retried.
    pub async fn open(&self) -> Result<ServerCapabilities, MsgError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if self.state() == ConnectionState::Open {
            debug!("open: already connected to {}", self.shared.config.addr());
            return Ok(self.capabilities());
        }

        let addr = self.shared.config.addr();
        info!("Connecting to MSG server at {}", addr);
        let stream = connect_tcp(&addr, self.shared.config.connect_timeout()).await?;
        self.start(stream).await
    }

    /// Like [`open`](Self::open) over an already established stream
    pub async fn open_stream<S>(&self, stream: S) -> Result<ServerCapabilities, MsgError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if self.state() == ConnectionState::Open {
            return Ok(self.capabilities());
        }
        self.start(stream).await
    }

    async fn start<S>(&self, stream: S) -> Result<ServerCapabilities, MsgError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        // A loop that died with its connection still has a handle parked here
        self.stop_loop().await;

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut codec = LineCodec::new();
        let limit = self.shared.config.handshake_timeout();
        let caps = tokio::time::timeout(limit, handshake(&mut reader, &mut writer, &mut codec))
            .await
            .map_err(|_| MsgError::Protocol(format!("handshake timed out after {:?}", limit)))??;

        *self.shared.caps() = caps.clone();
        self.shared.writer.install(Box::new(writer)).await;
        self.shared.mux.resume();
        self.shared.state.send_replace(ConnectionState::Open);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_read_loop(
            Box::new(reader),
            codec,
            self.shared.clone(),
            stop_rx,
        ));
        *self.shared.control() = Some(LoopControl { stop_tx, handle });

        info!("Connected to MSG server {}", caps.name);
        Ok(caps)
    }

    /// Stop the read loop and release the transport
    ///
    /// Returns false, after logging, when the client was already closed.
    pub async fn close(&self) -> bool {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let was_open = self.state() == ConnectionState::Open;

        self.stop_loop().await;
        if !was_open {
            info!("close: not connected to {}", self.shared.config.addr());
            return false;
        }

        self.shared.state.send_replace(ConnectionState::Closed);
        self.shared.writer.shutdown().await;
        self.shared.mux.fail_all();
        self.shared.dispatcher.clear();
        info!("Closed connection to {}", self.shared.config.addr());
        true
    }

    /// Stop the read loop without closing the transport
    ///
    /// Callback tasks are cancelled and pending requests fail. Requests made
    /// afterwards fail with [`MsgError::Stopped`] until the client is closed
    /// and reopened. Returns false if no loop was running.
    pub async fn stop(&self) -> bool {
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.stop_loop().await
    }

    async fn stop_loop(&self) -> bool {
        let control = self.shared.control().take();
        let Some(LoopControl { stop_tx, handle }) = control else {
            return false;
        };

        let _ = stop_tx.send(true);
        match handle.await {
            Ok(exit) => debug!("Read loop exited: {:?}", exit),
            Err(e) if e.is_panic() => warn!("Read loop panicked: {}", e),
            Err(_) => {}
        }

        self.shared
            .dispatcher
            .cancel_callbacks(self.shared.config.stop_grace())
            .await;
        self.shared.mux.fail_all();
        true
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Whether the read loop is alive
    pub fn is_running(&self) -> bool {
        self.shared
            .control()
            .as_ref()
            .is_some_and(|c| !c.handle.is_finished())
    }

    /// Wait until the connection is closed, by either side
    pub async fn wait_closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Snapshot of the capabilities from the last handshake
    pub fn capabilities(&self) -> ServerCapabilities {
        self.shared.caps().clone()
    }

    /// Currently subscribed parameters, sorted
    pub fn subscribed(&self) -> Vec<String> {
        self.shared.dispatcher.subscribed()
    }

    /// Last value seen for a subscribed parameter, tokens space-joined
    pub fn value(&self, param: &str) -> Option<String> {
        self.shared.dispatcher.value(param)
    }

    /// Number of requests awaiting replies
    pub fn pending_requests(&self) -> usize {
        self.shared.mux.pending_count()
    }

    /// Local checks made before anything is written
    fn check_request(&self, command: &str, args: &[String]) -> Result<(), MsgError> {
        if self.state() != ConnectionState::Open {
            return Err(MsgError::NotConnected);
        }

        {
            let caps = self.shared.caps();
            if command == GET {
                let param = args.first().map(String::as_str).unwrap_or_default();
                if !caps.is_published(param) {
                    return Err(MsgError::UnknownParameter {
                        param: param.to_string(),
                        server: caps.name.clone(),
                    });
                }
            } else if !caps.is_registered(command) {
                return Err(MsgError::UnknownCommand {
                    command: command.to_string(),
                    server: caps.name.clone(),
                });
            }
        }

        self.check_running()
    }

    fn check_published(&self, param: &str) -> Result<(), MsgError> {
        if self.state() != ConnectionState::Open {
            return Err(MsgError::NotConnected);
        }
        let caps = self.shared.caps();
        if caps.is_published(param) {
            Ok(())
        } else {
            Err(MsgError::UnknownParameter {
                param: param.to_string(),
                server: caps.name.clone(),
            })
        }
    }

    fn check_running(&self) -> Result<(), MsgError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(MsgError::Stopped)
        }
    }

    /// Send `command` and wait for its ack
    ///
    /// `get` requires a published parameter, every other command must be
    /// registered; both are checked locally first. `timeout` falls back to
    /// the configured default. A timed-out request is forgotten, so a late
    /// reply is logged and dropped.
    pub async fn send<I, A>(
        &self,
        command: &str,
        args: I,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>, MsgError>
    where
        I: IntoIterator<Item = A>,
        A: fmt::Display,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.to_string()).collect();
        self.check_request(command, &args)?;

        let (tx, rx) = oneshot::channel();
        let guard = self.shared.mux.register(Waiter::Request(tx))?;
        let request = Request::new(guard.id(), command, &args)?;
        debug!(id = guard.id(), "-> {}", request);
        self.shared.writer.write_line(&request.encode()).await?;

        let reply = match timeout.or(self.shared.config.default_timeout()) {
            Some(after) => tokio::time::timeout(after, rx).await.map_err(|_| {
                debug!(id = guard.id(), "{} timed out after {:?}", command, after);
                MsgError::Timeout {
                    command: command.to_string(),
                    after,
                }
            })?,
            None => rx.await,
        };
        drop(guard);

        match reply {
            Ok(Ok(args)) => Ok(args),
            Ok(Err(reason)) => Err(MsgError::Command {
                command: command.to_string(),
                reason,
            }),
            Err(_) => Err(MsgError::ConnectionClosed),
        }
    }

    /// Read a published parameter's value tokens
    pub async fn get(&self, param: &str) -> Result<Vec<String>, MsgError> {
        self.send(GET, [param], None).await
    }

    /// [`get`](Self::get) with an explicit timeout
    pub async fn get_with_timeout(
        &self,
        param: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, MsgError> {
        self.send(GET, [param], Some(timeout)).await
    }

    /// Read a published parameter as one space-joined string
    pub async fn get_joined(&self, param: &str) -> Result<String, MsgError> {
        Ok(self.get(param).await?.join(" "))
    }

    /// Run a registered command
    pub async fn run<I, A>(&self, command: &str, args: I) -> Result<Vec<String>, MsgError>
    where
        I: IntoIterator<Item = A>,
        A: fmt::Display,
    {
        self.send(command, args, None).await
    }

    /// [`run`](Self::run) with an explicit timeout
    pub async fn run_with_timeout<I, A>(
        &self,
        command: &str,
        args: I,
        timeout: Duration,
    ) -> Result<Vec<String>, MsgError>
    where
        I: IntoIterator<Item = A>,
        A: fmt::Display,
    {
        self.send(command, args, Some(timeout)).await
    }

    /// Subscribe to a published parameter
    ///
    /// Returns once the `sub` line is written; the server's ack is not
    /// awaited. A value carried by that ack is delivered like any push.
    /// Subscribing again is a no-op and keeps the first callback.
    ///
    /// The ack's pending entry counts in [`pending_requests`](Self::pending_requests)
    /// until it arrives or the connection is closed or stopped.
    pub async fn subscribe(&self, param: &str, callback: Option<Callback>) -> Result<(), MsgError> {
        if !self.begin_subscription(param, callback)? {
            return Ok(());
        }

        let waiter = Waiter::Subscription {
            param: param.to_string(),
            confirm: None,
        };
        match self.write_subscription(param, waiter).await {
            Ok(guard) => {
                guard.detach();
                Ok(())
            }
            Err(e) => {
                self.shared.dispatcher.remove(param);
                Err(e)
            }
        }
    }

    /// Subscribe and wait for the server's ack
    ///
    /// A `nak` or a timeout undoes the local subscription and fails with
    /// [`MsgError::Command`] or [`MsgError::Timeout`]. Returns immediately if
    /// already subscribed.
    pub async fn subscribe_confirmed(
        &self,
        param: &str,
        callback: Option<Callback>,
        timeout: Option<Duration>,
    ) -> Result<(), MsgError> {
        if !self.begin_subscription(param, callback)? {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel::<Reply>();
        let waiter = Waiter::Subscription {
            param: param.to_string(),
            confirm: Some(tx),
        };
        let guard = match self.write_subscription(param, waiter).await {
            Ok(guard) => guard,
            Err(e) => {
                self.shared.dispatcher.remove(param);
                return Err(e);
            }
        };

        let reply = match timeout.or(self.shared.config.default_timeout()) {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    drop(guard);
                    self.shared.dispatcher.remove(param);
                    debug!(param, "sub timed out after {:?}", after);
                    return Err(MsgError::Timeout {
                        command: format!("sub {}", param),
                        after,
                    });
                }
            },
            None => rx.await,
        };
        drop(guard);

        match reply {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(reason)) => {
                self.shared.dispatcher.remove(param);
                Err(MsgError::Command {
                    command: format!("sub {}", param),
                    reason,
                })
            }
            Err(_) => Err(MsgError::ConnectionClosed),
        }
    }

    /// Validate and record a subscription; false if it already existed
    fn begin_subscription(&self, param: &str, callback: Option<Callback>) -> Result<bool, MsgError> {
        self.check_published(param)?;
        self.check_running()?;
        validate_token(param)?;

        if self.shared.dispatcher.insert(param, callback) {
            Ok(true)
        } else {
            debug!(param, "Already subscribed");
            Ok(false)
        }
    }

    async fn write_subscription(
        &self,
        param: &str,
        waiter: Waiter,
    ) -> Result<PendingGuard<'_>, MsgError> {
        let guard = self.shared.mux.register(waiter)?;
        let request = Request::subscribe(guard.id(), param)?;
        debug!(id = guard.id(), "-> {}", request);
        self.shared.writer.write_line(&request.encode()).await?;
        Ok(guard)
    }

    /// Cancel a subscription
    ///
    /// No-op if `param` is not subscribed. The server's ack is not awaited;
    /// like `sub`, its pending entry lasts until the ack or the next close.
    /// When the client is closed or stopped nothing is written and the
    /// subscription is kept.
    pub async fn unsubscribe(&self, param: &str) -> Result<(), MsgError> {
        if !self.shared.dispatcher.contains(param) {
            debug!(param, "Not subscribed");
            return Ok(());
        }
        if self.state() != ConnectionState::Open {
            return Err(MsgError::NotConnected);
        }
        self.check_running()?;
        if !self.shared.dispatcher.remove(param) {
            return Ok(());
        }

        // Nobody listens; the ack is consumed quietly instead of as an orphan
        let (tx, _) = oneshot::channel();
        let guard = self.shared.mux.register(Waiter::Request(tx))?;
        let request = Request::unsubscribe(guard.id(), param)?;
        debug!(id = guard.id(), "-> {}", request);
        self.shared.writer.write_line(&request.encode()).await?;
        guard.detach();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn shared_for_test(&self) -> Arc<Shared> {
        self.shared.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msg_sim::{run_virtual_server_task, VirtualServer, VirtualServerConfig};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::sync::broadcast;

    /// Handshake as a server publishing `foo`, then never answer again
    async fn open_over_silent_duplex() -> Client {
        let (client_io, mut server_io) = duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = server_io.read(&mut buf).await;
            server_io
                .write_all(b"1 ack\nserver QUIET\npublished foo\n----LIST----\n")
                .await
                .unwrap();
            while matches!(server_io.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        let mut config = ClientConfig::default();
        config.read_poll_interval_ms = 20;
        let client = Client::new(config);
        client.open_stream(client_io).await.unwrap();
        client
    }

    async fn open_over_duplex() -> (Client, broadcast::Sender<msg_sim::VirtualServerCommand>) {
        let (client_io, server_io) = duplex(4096);
        let (cmd_tx, cmd_rx) = broadcast::channel(8);
        let server = VirtualServer::from_config(VirtualServerConfig::default());
        tokio::spawn(run_virtual_server_task(
            server_io,
            server,
            cmd_rx,
            Arc::new(AtomicUsize::new(0)),
        ));

        let mut config = ClientConfig::default();
        config.read_poll_interval_ms = 20;
        let client = Client::new(config);
        client.open_stream(client_io).await.unwrap();
        (client, cmd_tx)
    }

    #[tokio::test]
    async fn test_open_stream_and_get() {
        let (client, _cmd) = open_over_duplex().await;
        assert_eq!(client.state(), ConnectionState::Open);
        assert!(client.is_running());
        assert_eq!(client.capabilities().name, "TESTSRV");
        assert_eq!(client.get("bar").await.unwrap(), vec!["baz"]);
        assert!(client.close().await);
    }

    #[tokio::test]
    async fn test_stop_keeps_transport_but_refuses_requests() {
        let (client, _cmd) = open_over_duplex().await;
        assert!(client.stop().await);
        assert!(!client.is_running());
        assert_eq!(client.state(), ConnectionState::Open);
        assert!(matches!(client.get("bar").await, Err(MsgError::Stopped)));
        assert!(!client.stop().await);
        assert!(client.close().await);
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_quiet() {
        let (client, _cmd) = open_over_duplex().await;
        client.subscribe("bar", None).await.unwrap();
        assert_eq!(client.subscribed(), vec!["bar"]);

        client.unsubscribe("bar").await.unwrap();
        client.unsubscribe("bar").await.unwrap();
        assert!(client.subscribed().is_empty());
        client.close().await;
    }

    #[tokio::test]
    async fn test_send_validates_before_registering() {
        let (client, _cmd) = open_over_duplex().await;
        let err = client.run("multiply", ["4\n5"]).await.unwrap_err();
        assert!(matches!(err, MsgError::Encode(_)));
        assert_eq!(client.pending_requests(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_stop_fails_waiting_request_and_refuses_new_ones() {
        let client = open_over_silent_duplex().await;
        let waiting = tokio::spawn({
            let client = client.clone();
            async move { client.get("foo").await }
        });
        while client.pending_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(client.stop().await);
        let result = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(MsgError::ConnectionClosed)));

        // A caller that passed the running check before the stop
        let (tx, _rx) = oneshot::channel();
        let refused = client.shared.mux.register(Waiter::Request(tx));
        assert!(matches!(refused, Err(MsgError::Stopped)));
        assert_eq!(client.pending_requests(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_reopen_accepts_requests_after_stop() {
        let (client, _cmd) = open_over_duplex().await;
        client.stop().await;
        assert!(client.close().await);

        let (client_io, server_io) = duplex(4096);
        let (_cmd_tx, cmd_rx) = broadcast::channel(8);
        let server = VirtualServer::from_config(VirtualServerConfig::default());
        tokio::spawn(run_virtual_server_task(
            server_io,
            server,
            cmd_rx,
            Arc::new(AtomicUsize::new(0)),
        ));
        client.open_stream(client_io).await.unwrap();
        assert_eq!(client.get("bar").await.unwrap(), vec!["baz"]);
        client.close().await;
    }

    #[tokio::test]
    async fn test_unanswered_subscribe_confirmed_times_out_and_unsubscribes() {
        let client = open_over_silent_duplex().await;
        let err = client
            .subscribe_confirmed("foo", None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, MsgError::Timeout { .. }));
        assert!(client.subscribed().is_empty());
        assert_eq!(client.pending_requests(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_after_stop_keeps_subscription() {
        let (client, _cmd) = open_over_duplex().await;
        client.subscribe("bar", None).await.unwrap();
        client.stop().await;

        assert!(matches!(client.unsubscribe("bar").await, Err(MsgError::Stopped)));
        assert_eq!(client.subscribed(), vec!["bar"]);
        client.close().await;
    }

    #[tokio::test]
    async fn test_unacked_subscribe_is_released_on_close() {
        let client = open_over_silent_duplex().await;
        client.subscribe("foo", None).await.unwrap();
        assert_eq!(client.pending_requests(), 1);

        assert!(client.close().await);
        assert_eq!(client.pending_requests(), 0);
    }
}
