//! Read loop
//!
//! One task per open connection. It owns the read half and the codec, routes
//! every complete line and exits when asked to stop or when the transport
//! fails. Reads are bounded by the configured poll interval so the stop flag
//! is re-checked even on a silent connection.

use std::io;
use std::sync::Arc;

use msg_protocol::{LineCodec, Message};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::client::Shared;
use crate::connection::{BoxedReader, ConnectionState};

/// Why the read loop returned
#[derive(Debug)]
pub(crate) enum LoopExit {
    /// `stop()` was requested
    Stopped,
    /// Server closed the connection
    Eof,
    /// Transport read failed
    Error(io::Error),
}

/// Run until stopped or the transport fails
///
/// On EOF or a read error the connection is torn down here: state goes to
/// `Closed`, every pending request fails and the subscription table is
/// emptied.
pub(crate) async fn run_read_loop(
    mut reader: BoxedReader,
    mut codec: LineCodec,
    shared: Arc<Shared>,
    mut stop_rx: watch::Receiver<bool>,
) -> LoopExit {
    let poll = shared.config.read_poll_interval();
    let mut buf = vec![0u8; 4096];

    info!("Read loop started for {}", shared.config.addr());

    // Lines that arrived together with the end of the handshake
    drain(&mut codec, &shared);

    let exit = loop {
        if *stop_rx.borrow() {
            break LoopExit::Stopped;
        }

        tokio::select! {
            biased;

            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break LoopExit::Stopped;
                }
            }

            result = tokio::time::timeout(poll, reader.read(&mut buf)) => {
                match result {
                    // Liveness checkpoint; partial line stays buffered
                    Err(_) => trace!("Read loop idle for {:?}", poll),
                    Ok(Ok(0)) => break LoopExit::Eof,
                    Ok(Ok(n)) => {
                        codec.push_bytes(&buf[..n]);
                        drain(&mut codec, &shared);
                    }
                    Ok(Err(e)) => break LoopExit::Error(e),
                }
            }
        }
    };

    match &exit {
        LoopExit::Stopped => info!("Read loop stopped"),
        LoopExit::Eof => {
            warn!("MSG server {} closed the connection", shared.config.addr());
            teardown(&shared).await;
        }
        LoopExit::Error(e) => {
            warn!("Read from MSG server {} failed: {}", shared.config.addr(), e);
            teardown(&shared).await;
        }
    }
    exit
}

fn drain(codec: &mut LineCodec, shared: &Shared) {
    while let Some(line) = codec.next_line() {
        debug!("<- {}", line);
        route(shared, Message::parse(&line));
    }
}

/// Hand one decoded message to whoever is waiting for it
pub(crate) fn route(shared: &Shared, message: Message) {
    match message {
        Message::Push { param, value } => {
            shared.dispatcher.dispatch(&param, value);
        }
        Message::Ack { id, args } => resolve(shared, id, Ok(args)),
        Message::Nak { id, reason } => resolve(shared, id, Err(reason)),
        Message::Unrecognized { raw } => warn!("Dropping unrecognized line {:?}", raw),
    }
}

fn resolve(shared: &Shared, id: u32, reply: Result<Vec<String>, String>) {
    match shared.mux.take(id) {
        Some(waiter) => waiter.resolve(id, reply, &shared.dispatcher),
        None => warn!(id, "Dropping reply with no pending request: {:?}", reply),
    }
}

async fn teardown(shared: &Shared) {
    shared.state.send_replace(ConnectionState::Closed);
    shared.writer.shutdown().await;
    let failed = shared.mux.fail_all();
    shared.dispatcher.clear();
    if failed > 0 {
        info!("Failed {} pending requests after connection loss", failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::ClientConfig;
    use crate::multiplexer::Waiter;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::sync::oneshot;

    fn test_shared() -> Arc<Shared> {
        let mut config = ClientConfig::default();
        config.read_poll_interval_ms = 20;
        Client::new(config).shared_for_test()
    }

    #[tokio::test]
    async fn test_partial_line_is_held_until_newline() {
        let shared = test_shared();
        let (tx, rx) = oneshot::channel();
        let id = shared.mux.register(Waiter::Request(tx)).unwrap().detach();

        let (client, mut server) = duplex(1024);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_read_loop(
            Box::new(client),
            LineCodec::new(),
            shared.clone(),
            stop_rx,
        ));

        server.write_all(format!("{} ack ba", id).as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(shared.mux.is_pending(id));

        server.write_all(b"z\n").await.unwrap();
        assert_eq!(rx.await.unwrap(), Ok(vec!["baz".to_string()]));

        stop_tx.send(true).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, LoopExit::Stopped));
    }

    #[tokio::test]
    async fn test_eof_fails_pending_requests() {
        let shared = test_shared();
        shared.state.send_replace(ConnectionState::Open);
        let (tx, rx) = oneshot::channel();
        shared.mux.register(Waiter::Request(tx)).unwrap().detach();
        shared.dispatcher.insert("foo", None);

        let (client, server) = duplex(1024);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_read_loop(
            Box::new(client),
            LineCodec::new(),
            shared.clone(),
            stop_rx,
        ));

        drop(server);
        assert!(matches!(task.await.unwrap(), LoopExit::Eof));
        assert!(rx.await.is_err());
        assert_eq!(*shared.state.borrow(), ConnectionState::Closed);
        assert!(shared.dispatcher.subscribed().is_empty());
    }

    #[tokio::test]
    async fn test_orphans_and_garbage_are_dropped() {
        let shared = test_shared();
        let (tx, rx) = oneshot::channel();
        let id = shared.mux.register(Waiter::Request(tx)).unwrap().detach();

        route(&shared, Message::parse("99 ack stray"));
        route(&shared, Message::parse("complete nonsense"));
        route(&shared, Message::parse("set nobody 1"));
        assert!(shared.mux.is_pending(id));

        route(&shared, Message::parse(&format!("{} nak no such thing", id)));
        assert_eq!(rx.await.unwrap(), Err("no such thing".to_string()));
        assert_eq!(shared.mux.pending_count(), 0);
    }
}
