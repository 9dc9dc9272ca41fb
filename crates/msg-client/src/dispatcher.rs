//! Publish/subscribe dispatcher
//!
//! Owns the subscription table (parameter → last value + callback) and runs
//! callbacks for pushed values. Callbacks never run on the read loop itself:
//! each subscription with a callback gets one worker task, tracked in a
//! [`JoinSet`], fed through its own queue. Values for one parameter reach the
//! callback in arrival order; a slow callback holds up only its own
//! parameter, and `stop()` can cancel every worker.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

type SyncFn = dyn Fn(Vec<String>) + Send + Sync;
type AsyncFn = dyn Fn(Vec<String>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync;

/// Handler for pushed values of one parameter
///
/// Receives the value tokens. Must not block or do CPU-heavy work.
#[derive(Clone)]
pub enum Callback {
    /// Plain function, run on the subscription's worker
    Sync(Arc<SyncFn>),
    /// Function returning a future, awaited on the subscription's worker
    Async(Arc<AsyncFn>),
}

impl Callback {
    /// Wrap a plain function
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<String>) + Send + Sync + 'static,
    {
        Callback::Sync(Arc::new(f))
    }

    /// Wrap an async function
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Callback::Async(Arc::new(
            move |value| -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(f(value)) },
        ))
    }

    async fn call(&self, value: Vec<String>) {
        match self {
            Callback::Sync(f) => f(value),
            Callback::Async(f) => f(value).await,
        }
    }
}

/// Feed queued values to `callback` one at a time until the queue closes
async fn run_worker(param: String, callback: Callback, mut rx: mpsc::UnboundedReceiver<Vec<String>>) {
    while let Some(value) = rx.recv().await {
        callback.call(value).await;
    }
    debug!(param = %param, "Callback worker finished");
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Sync(_) => f.write_str("Callback::Sync"),
            Callback::Async(_) => f.write_str("Callback::Async"),
        }
    }
}

#[derive(Debug, Default)]
struct Subscription {
    /// Last value, tokens joined by single spaces
    value: Option<String>,
    callback: Option<Callback>,
    /// Queue of the worker running `callback`, started on first push
    queue: Option<mpsc::UnboundedSender<Vec<String>>>,
}

/// Subscription table and callback task tracker
#[derive(Debug, Default)]
pub struct Dispatcher {
    table: Mutex<HashMap<String, Subscription>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a subscription; returns false (keeping the first callback) if
    /// `param` is already subscribed
    pub fn insert(&self, param: &str, callback: Option<Callback>) -> bool {
        let mut table = self.table();
        if table.contains_key(param) {
            return false;
        }
        table.insert(
            param.to_string(),
            Subscription {
                value: None,
                callback,
                queue: None,
            },
        );
        true
    }

    /// Forget a subscription; returns false if it did not exist
    pub fn remove(&self, param: &str) -> bool {
        self.table().remove(param).is_some()
    }

    pub fn contains(&self, param: &str) -> bool {
        self.table().contains_key(param)
    }

    /// Subscribed parameters, sorted
    pub fn subscribed(&self) -> Vec<String> {
        let mut params: Vec<String> = self.table().keys().cloned().collect();
        params.sort();
        params
    }

    /// Last value seen for `param` (None if unsubscribed or nothing seen yet)
    pub fn value(&self, param: &str) -> Option<String> {
        self.table().get(param).and_then(|s| s.value.clone())
    }

    /// Drop every subscription
    pub fn clear(&self) {
        self.table().clear();
    }

    /// Store a pushed value and queue it for the parameter's callback
    ///
    /// Returns false when `param` is not subscribed; the value is dropped.
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, param: &str, value: Vec<String>) -> bool {
        let mut table = self.table();
        let Some(sub) = table.get_mut(param) else {
            debug!(param, "Dropping push for unsubscribed parameter");
            return false;
        };
        sub.value = Some(value.join(" "));

        let Some(callback) = sub.callback.clone() else {
            return true;
        };

        // A worker that was cancelled or panicked has dropped its receiver
        let value = match sub.queue.as_ref() {
            Some(queue) => match queue.send(value) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(value)) => value,
            },
            None => value,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(value);
        sub.queue = Some(tx);

        let mut tasks = self.tasks();
        Self::reap(&mut tasks);
        tasks.spawn(run_worker(param.to_string(), callback, rx));
        true
    }

    /// Collect finished callback tasks, logging panics
    fn reap(tasks: &mut JoinSet<()>) {
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!("Subscription callback worker panicked: {}", e);
                }
            }
        }
    }

    /// Number of callback workers not yet reaped
    pub fn running_callbacks(&self) -> usize {
        self.tasks().len()
    }

    /// Cancel every callback worker and wait up to `grace` for them to unwind
    ///
    /// Queued values are dropped. A later push restarts the worker.
    pub async fn cancel_callbacks(&self, grace: Duration) {
        let mut tasks = std::mem::take(&mut *self.tasks());
        if tasks.is_empty() {
            return;
        }

        debug!("Cancelling {} callback tasks", tasks.len());
        tasks.abort_all();
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Callback tasks still unwinding after {:?}", grace);
        }
    }
}
