//! Request multiplexer
//!
//! Many callers share one connection. Each request gets a correlation ID and
//! a private single-slot channel; the read loop hands the matching `ack`/`nak`
//! to exactly that channel and removes the entry.
//!
//! ```text
//!  caller ──register()──► pending: HashMap<id, Pending> ◄──take(id)── read loop
//!     │                                                                 │
//!     └──────────── oneshot::Receiver ◄─────── oneshot::Sender ◄────────┘
//! ```
//!
//! IDs count up from 1 and wrap back to 1 at [`MAXID`]. An ID that is still
//! pending is skipped, so a late reply can never reach a newer request.
//!
//! [`fail_all`](Multiplexer::fail_all) also closes the table: registrations
//! are refused with [`MsgError::Stopped`] until [`resume`](Multiplexer::resume)
//! is called for the next connection.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use msg_protocol::MAXID;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::error::MsgError;

/// Outcome delivered to a waiter: ack arguments or nak reason
pub(crate) type Reply = Result<Vec<String>, String>;

/// Who is waiting on a correlation ID
#[derive(Debug)]
pub(crate) enum Waiter {
    /// A `get`/`run` caller
    Request(oneshot::Sender<Reply>),
    /// A `sub` request; its ack carries the parameter's current value
    Subscription {
        param: String,
        confirm: Option<oneshot::Sender<Reply>>,
    },
}

impl Waiter {
    /// Deliver `reply`, consuming the waiter
    pub(crate) fn resolve(self, id: u32, reply: Reply, dispatcher: &Dispatcher) {
        match self {
            Waiter::Request(tx) => {
                if tx.send(reply).is_err() {
                    debug!(id, "Requester went away before its reply arrived");
                }
            }
            Waiter::Subscription { param, confirm } => {
                match &reply {
                    Ok(value) if !value.is_empty() => {
                        dispatcher.dispatch(&param, value.clone());
                    }
                    Ok(_) => debug!(id, param = %param, "Subscription acknowledged"),
                    Err(reason) => {
                        warn!(id, param = %param, reason = %reason, "Server rejected subscription")
                    }
                }
                if let Some(tx) = confirm {
                    let _ = tx.send(reply);
                }
            }
        }
    }
}

#[derive(Debug)]
struct Pending {
    serial: u64,
    waiter: Waiter,
}

#[derive(Debug)]
struct MuxState {
    next_id: u32,
    next_serial: u64,
    pending: HashMap<u32, Pending>,
    accepting: bool,
}

/// Correlation ID allocator and pending-request table
#[derive(Debug)]
pub struct Multiplexer {
    state: Mutex<MuxState>,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexer {
    /// Create an empty multiplexer whose first ID is 1
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MuxState {
                next_id: 1,
                next_serial: 0,
                pending: HashMap::new(),
                accepting: true,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next correlation ID, skipping IDs that are still pending
    ///
    /// Only when every ID in `1..MAXID` is pending does this return one that
    /// is in use; [`register`](Self::register) refuses it in that case.
    pub fn allocate_id(&self) -> u32 {
        let mut state = self.lock();
        Self::next_free(&mut state)
    }

    fn next_free(state: &mut MuxState) -> u32 {
        let mut id = state.next_id;
        for _ in 1..MAXID {
            id = state.next_id;
            state.next_id = if id + 1 >= MAXID { 1 } else { id + 1 };
            if !state.pending.contains_key(&id) {
                break;
            }
        }
        id
    }

    /// Allocate an ID and park `waiter` under it
    pub(crate) fn register(&self, waiter: Waiter) -> Result<PendingGuard<'_>, MsgError> {
        let mut state = self.lock();
        if !state.accepting {
            return Err(MsgError::Stopped);
        }
        let id = Self::next_free(&mut state);
        if state.pending.contains_key(&id) {
            return Err(MsgError::TooManyPending(state.pending.len()));
        }

        let serial = state.next_serial;
        state.next_serial += 1;
        state.pending.insert(id, Pending { serial, waiter });

        Ok(PendingGuard {
            mux: self,
            id,
            serial,
            armed: true,
        })
    }

    /// Remove and return the waiter for `id`
    pub(crate) fn take(&self, id: u32) -> Option<Waiter> {
        self.lock().pending.remove(&id).map(|p| p.waiter)
    }

    fn remove_if(&self, id: u32, serial: u64) -> bool {
        let mut state = self.lock();
        match state.pending.get(&id) {
            Some(p) if p.serial == serial => {
                state.pending.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Whether a request with `id` is awaiting its reply
    pub fn is_pending(&self, id: u32) -> bool {
        self.lock().pending.contains_key(&id)
    }

    /// Number of requests awaiting replies
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Drop every waiter and refuse new ones until [`resume`](Self::resume)
    ///
    /// Receivers of the dropped waiters observe a closed channel.
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<Pending> = {
            let mut state = self.lock();
            state.accepting = false;
            state.pending.drain().map(|(_, p)| p).collect()
        };
        if !drained.is_empty() {
            debug!("Failing {} pending requests", drained.len());
        }
        drained.len()
    }

    /// Accept registrations again after [`fail_all`](Self::fail_all)
    pub(crate) fn resume(&self) {
        self.lock().accepting = true;
    }
}

/// Keeps a pending entry alive while its caller waits
///
/// Dropping the guard (timeout, cancelled future) removes the entry unless the
/// read loop already consumed it.
#[derive(Debug)]
pub(crate) struct PendingGuard<'a> {
    mux: &'a Multiplexer,
    id: u32,
    serial: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Leave the entry for the read loop to consume
    ///
    /// Used for `sub`/`uns`, whose callers do not wait. If the server never
    /// answers, the entry stays until the next [`Multiplexer::fail_all`], which
    /// runs on close, stop and connection loss.
    pub(crate) fn detach(mut self) -> u32 {
        self.armed = false;
        self.id
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.mux.remove_if(self.id, self.serial) {
            debug!(id = self.id, "Removed abandoned pending request");
        }
    }
}
