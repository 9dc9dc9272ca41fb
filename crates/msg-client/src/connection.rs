//! Transport ownership and the `lst` handshake
//!
//! The connection is split once it is open: the read half goes to the read
//! loop, the write half stays here behind an async mutex so concurrent
//! callers never interleave partial lines.

use std::time::Duration;

use msg_protocol::{Encode, LineCodec, ListingLine, Message, Request};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::capabilities::ServerCapabilities;
use crate::error::MsgError;

/// Correlation ID used by the handshake
const HANDSHAKE_ID: u32 = 1;

/// Boxed read half handed to the read loop
pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half owned by [`LineWriter`]
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Whether the client holds a live, handshaken transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Closed,
    Open,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed => f.write_str("closed"),
            ConnectionState::Open => f.write_str("open"),
        }
    }
}

/// Serialized access to the write half
#[derive(Default)]
pub(crate) struct LineWriter {
    inner: Mutex<Option<BoxedWriter>>,
}

impl LineWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replace the write half
    pub(crate) async fn install(&self, writer: BoxedWriter) {
        *self.inner.lock().await = Some(writer);
    }

    /// Write one encoded line and flush it
    pub(crate) async fn write_line(&self, line: &[u8]) -> Result<(), MsgError> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(MsgError::NotConnected)?;
        trace!("-> {:?}", String::from_utf8_lossy(line));
        writer.write_all(line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Flush and drop the write half; returns false if there was none
    pub(crate) async fn shutdown(&self) -> bool {
        let Some(mut writer) = self.inner.lock().await.take() else {
            return false;
        };
        if let Err(e) = writer.shutdown().await {
            debug!("Error shutting down writer: {}", e);
        }
        true
    }
}

impl std::fmt::Debug for LineWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineWriter").finish_non_exhaustive()
    }
}

/// Dial `addr`, bounded by `timeout`
pub(crate) async fn connect_tcp(addr: &str, timeout: Duration) -> Result<TcpStream, MsgError> {
    let connect_err = |source| MsgError::Connect {
        addr: addr.to_string(),
        source,
    };

    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            connect_err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no connection after {:?}", timeout),
            ))
        })?
        .map_err(connect_err)?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY: {}", e);
    }
    Ok(stream)
}

/// Read until the codec yields a complete line
async fn read_line<R>(reader: &mut R, codec: &mut LineCodec) -> Result<String, MsgError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 1024];
    loop {
        if let Some(line) = codec.next_line() {
            return Ok(line);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(MsgError::Protocol(
                "connection closed during handshake".to_string(),
            ));
        }
        codec.push_bytes(&buf[..n]);
    }
}

/// Perform the `lst` exchange on a fresh transport
///
/// Bytes read past the sentinel stay in `codec` for the read loop.
pub(crate) async fn handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    codec: &mut LineCodec,
) -> Result<ServerCapabilities, MsgError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let request = Request::list(HANDSHAKE_ID)?;
    writer.write_all(&request.encode()).await?;
    writer.flush().await?;

    let first = read_line(reader, codec).await?;
    match Message::parse(&first) {
        Message::Ack { id: HANDSHAKE_ID, .. } => {}
        Message::Nak { reason, .. } => {
            return Err(MsgError::Protocol(format!("server refused lst: {}", reason)));
        }
        _ => {
            return Err(MsgError::Protocol(format!(
                "expected \"{} ack\", got {:?}",
                HANDSHAKE_ID, first
            )));
        }
    }

    let mut caps = ServerCapabilities::default();
    loop {
        let line = read_line(reader, codec).await?;
        match ListingLine::classify(&line) {
            ListingLine::End => break,
            ListingLine::Other(other) => debug!("Ignoring listing line {:?}", other),
            listed => caps.absorb(listed),
        }
    }

    info!(
        "Handshake with {}: {} published, {} registered",
        caps.name,
        caps.published.len(),
        caps.registered.len()
    );
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn serve_script(script: &'static str) -> Result<(ServerCapabilities, LineCodec), MsgError> {
        let (client, mut server) = duplex(4096);
        let (mut rd, mut wr) = tokio::io::split(client);

        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"1 lst\n");
            server.write_all(script.as_bytes()).await.unwrap();
        });

        let mut codec = LineCodec::new();
        let result = handshake(&mut rd, &mut wr, &mut codec).await;
        server_task.await.unwrap();
        result.map(|caps| (caps, codec))
    }

    #[tokio::test]
    async fn test_handshake_collects_listing() {
        let (caps, mut codec) = serve_script(
            "1 ack\nserver TESTSRV\npublished bar\npublished fizz\nregistered multiply\n\
             banner text\n----LIST----\nset foo 1\n",
        )
        .await
        .unwrap();

        assert_eq!(caps.name, "TESTSRV");
        assert!(caps.is_published("bar"));
        assert!(caps.is_published("fizz"));
        assert!(caps.is_registered("multiply"));
        // The push after the sentinel is left for the read loop
        assert_eq!(codec.next_message(), Some(Message::push("foo", ["1"])));
    }

    #[tokio::test]
    async fn test_handshake_rejects_nak() {
        let err = serve_script("1 nak not today\n").await.unwrap_err();
        assert!(matches!(err, MsgError::Protocol(msg) if msg.contains("not today")));
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_first_line() {
        let err = serve_script("server TESTSRV\n----LIST----\n").await.unwrap_err();
        assert!(matches!(err, MsgError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_handshake_eof_before_sentinel() {
        let err = serve_script("1 ack\nserver TESTSRV\n").await.unwrap_err();
        assert!(matches!(err, MsgError::Protocol(msg) if msg.contains("closed")));
    }

    #[tokio::test]
    async fn test_write_without_transport() {
        let writer = LineWriter::new();
        assert!(matches!(
            writer.write_line(b"2 get bar\n").await,
            Err(MsgError::NotConnected)
        ));
        assert!(!writer.shutdown().await);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect_tcp(&addr, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, MsgError::Connect { .. }));
        assert!(err.is_retryable());
    }
}
