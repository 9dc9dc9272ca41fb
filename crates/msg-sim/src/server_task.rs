//! Virtual server actor task
//!
//! This module provides a pure async task that owns a [`VirtualServer`] and
//! talks MSG over an async stream. The task uses a select! loop to:
//! - Read request lines from the stream and answer them
//! - Write delayed replies once their timers fire
//! - Handle control commands (value changes, raw lines, shutdown)
//!
//! [`spawn_tcp_server`] wraps the task in a loopback TCP listener so clients
//! can be exercised over a real socket.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use msg_protocol::LineCodec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{VirtualServer, VirtualServerConfig};

/// Commands that can be sent to a virtual server task
#[derive(Debug, Clone)]
pub enum VirtualServerCommand {
    /// Change a published value (pushes to subscribers)
    SetValue {
        /// Parameter name
        param: String,
        /// New value, space separated tokens
        value: String,
    },
    /// Write a line verbatim (a newline is appended)
    SendRaw(String),
    /// Shutdown the task
    Shutdown,
}

/// Run the virtual server task
///
/// This task owns the VirtualServer and processes:
/// 1. Request lines read from the stream
/// 2. Delayed replies scheduled by earlier requests
/// 3. Control commands from the command channel
///
/// Every complete request line read bumps `lines_received`.
pub async fn run_virtual_server_task<S>(
    mut stream: S,
    mut server: VirtualServer,
    mut cmd_rx: broadcast::Receiver<VirtualServerCommand>,
    lines_received: Arc<AtomicUsize>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = LineCodec::new();
    let mut buf = [0u8; 1024];
    let (delayed_tx, mut delayed_rx) = mpsc::unbounded_channel::<Vec<Vec<u8>>>();

    info!("Starting virtual server task for {}", server.name());

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("Virtual server stream closed for {}", server.name());
                        break;
                    }
                    Ok(n) => {
                        codec.push_bytes(&buf[..n]);
                        while let Some(line) = codec.next_line() {
                            lines_received.fetch_add(1, Ordering::SeqCst);
                            debug!("Virtual server {} received: {:?}", server.name(), line);

                            let response = server.process_line(&line);
                            if response.delay.is_zero() {
                                for out in &response.lines {
                                    stream.write_all(out).await?;
                                }
                            } else {
                                let tx = delayed_tx.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(response.delay).await;
                                    let _ = tx.send(response.lines);
                                });
                            }
                            flush_pushes(&mut stream, &mut server).await?;
                        }
                        stream.flush().await?;
                    }
                    Err(e) => {
                        warn!("Virtual server {} stream error: {}", server.name(), e);
                        return Err(e);
                    }
                }
            }

            Some(lines) = delayed_rx.recv() => {
                for out in &lines {
                    stream.write_all(out).await?;
                }
                stream.flush().await?;
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Ok(VirtualServerCommand::SetValue { param, value }) => {
                        debug!("Virtual server {} setting {} = {:?}", server.name(), param, value);
                        server.set_value(&param, &value);
                        flush_pushes(&mut stream, &mut server).await?;
                        stream.flush().await?;
                    }
                    Ok(VirtualServerCommand::SendRaw(line)) => {
                        stream.write_all(format!("{}\n", line).as_bytes()).await?;
                        stream.flush().await?;
                    }
                    Ok(VirtualServerCommand::Shutdown) => {
                        info!("Shutdown requested for virtual server {}", server.name());
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Virtual server {} missed {} commands", server.name(), skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Command channel closed for virtual server {}", server.name());
                        break;
                    }
                }
            }
        }
    }

    let _ = stream.shutdown().await;
    info!("Virtual server task ended for {}", server.name());
    Ok(())
}

async fn flush_pushes<S>(stream: &mut S, server: &mut VirtualServer) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    while let Some(out) = server.take_output() {
        stream.write_all(&out).await?;
    }
    Ok(())
}

/// A running loopback TCP virtual server
///
/// Each accepted connection gets its own [`VirtualServer`] built from the
/// same configuration. Commands are broadcast to every connection.
pub struct VirtualServerHandle {
    addr: SocketAddr,
    cmd_tx: broadcast::Sender<VirtualServerCommand>,
    lines_received: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl VirtualServerHandle {
    /// Address the listener is bound to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Port the listener is bound to
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Total request lines received over all connections
    pub fn lines_received(&self) -> usize {
        self.lines_received.load(Ordering::SeqCst)
    }

    /// Number of connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Change a published value on every connection
    pub fn set_value(&self, param: &str, value: &str) {
        let _ = self.cmd_tx.send(VirtualServerCommand::SetValue {
            param: param.to_string(),
            value: value.to_string(),
        });
    }

    /// Write a raw line on every connection
    pub fn send_raw(&self, line: &str) {
        let _ = self.cmd_tx.send(VirtualServerCommand::SendRaw(line.to_string()));
    }

    /// Close every connection and stop accepting new ones
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(VirtualServerCommand::Shutdown);
        self.accept_task.abort();
    }
}

impl Drop for VirtualServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind a virtual server on `127.0.0.1` with an OS-assigned port
pub async fn spawn_tcp_server(config: VirtualServerConfig) -> io::Result<VirtualServerHandle> {
    spawn_tcp_server_on("127.0.0.1:0", config).await
}

/// Bind a virtual server on `bind_addr`
pub async fn spawn_tcp_server_on(
    bind_addr: &str,
    config: VirtualServerConfig,
) -> io::Result<VirtualServerHandle> {
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    let (cmd_tx, _) = broadcast::channel(64);
    let lines_received = Arc::new(AtomicUsize::new(0));
    let connections = Arc::new(AtomicUsize::new(0));

    info!("Virtual server {} listening on {}", config.name, addr);

    let accept_task = {
        let cmd_tx = cmd_tx.clone();
        let lines_received = lines_received.clone();
        let connections = connections.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!("Virtual server accepted {}", peer);
                        connections.fetch_add(1, Ordering::SeqCst);
                        let server = VirtualServer::from_config(config.clone());
                        let task = run_virtual_server_task(
                            socket,
                            server,
                            cmd_tx.subscribe(),
                            lines_received.clone(),
                        );
                        tokio::spawn(async move {
                            if let Err(e) = task.await {
                                warn!("Virtual server connection {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Virtual server accept failed: {}", e);
                        break;
                    }
                }
            }
        })
    };

    Ok(VirtualServerHandle {
        addr,
        cmd_tx,
        lines_received,
        connections,
        accept_task,
    })
}
