//! Notify Worker - coalescing single-task event dispatcher
//!
//! Producers append events to a shared buffer and return immediately. One
//! background task per worker swaps the buffer out and runs the handler for
//! each event, in submission order, on a single logical thread of control.
//!
//! ```text
//! notify(e) ──► [buffer] ──(tick | 256 buffered | shutdown)──► handler(e1), handler(e2), ...
//! ```
//!
//! Components that mutate through a worker need no fine-grained locking for
//! their mutation paths: the handler is never run concurrently with itself.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Buffered events that trigger an early wake-up
pub const BATCH_THRESHOLD: usize = 256;

struct Buffer<E> {
    events: Vec<E>,
    closed: bool,
}

struct Shared<E> {
    name: String,
    buffer: Mutex<Buffer<E>>,
    wake: Notify,
    shutdown: Notify,
}

/// Cloneable producer handle for a [`NotifyWorker`]
pub struct NotifySender<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for NotifySender<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E> NotifySender<E> {
    /// Queue an event. Never blocks beyond the buffer lock.
    ///
    /// Returns the event back if the worker has shut down.
    pub fn notify(&self, event: E) -> Result<(), E> {
        let len = {
            let mut buffer = self.shared.buffer.lock();
            if buffer.closed {
                return Err(event);
            }
            buffer.events.push(event);
            buffer.events.len()
        };

        if len >= BATCH_THRESHOLD {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

/// Background dispatcher owning the worker task
pub struct NotifyWorker<E> {
    sender: NotifySender<E>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Send + 'static> NotifyWorker<E> {
    /// Spawn a worker on the current Tokio runtime.
    ///
    /// The worker wakes every `tick`, or early once [`BATCH_THRESHOLD`] events
    /// are buffered.
    pub fn spawn<F>(name: impl Into<String>, tick: Duration, handler: F) -> Self
    where
        F: FnMut(E) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            name: name.into(),
            buffer: Mutex::new(Buffer {
                events: Vec::new(),
                closed: false,
            }),
            wake: Notify::new(),
            shutdown: Notify::new(),
        });

        let handle = tokio::spawn(run(Arc::clone(&shared), tick, handler));

        Self {
            sender: NotifySender { shared },
            handle: Mutex::new(Some(handle)),
        }
    }
}

impl<E> NotifyWorker<E> {
    /// Queue an event; see [`NotifySender::notify`]
    pub fn notify(&self, event: E) -> Result<(), E> {
        self.sender.notify(event)
    }

    /// A producer handle that can outlive borrows of the worker
    pub fn sender(&self) -> NotifySender<E> {
        self.sender.clone()
    }

    /// Stop accepting events, handle everything still buffered, and wait for
    /// the task to exit
    pub async fn close(&self) {
        self.mark_closed();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Notify worker {} task failed: {}", self.sender.name(), e);
            }
        }
    }

    fn mark_closed(&self) {
        let mut buffer = self.sender.shared.buffer.lock();
        if !buffer.closed {
            buffer.closed = true;
            self.sender.shared.shutdown.notify_one();
        }
    }
}

impl<E> Drop for NotifyWorker<E> {
    fn drop(&mut self) {
        // Let the task drain and exit on its own
        self.mark_closed();
    }
}

async fn run<E, F>(shared: Arc<Shared<E>>, tick: Duration, mut handler: F)
where
    F: FnMut(E),
{
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut scratch = Vec::new();

    tracing::debug!("Notify worker {} started", shared.name);

    loop {
        let stopping = tokio::select! {
            _ = ticker.tick() => false,
            _ = shared.wake.notified() => false,
            _ = shared.shutdown.notified() => true,
        };

        handle_batch(&shared, &mut scratch, &mut handler);

        if stopping {
            break;
        }
    }

    tracing::debug!("Notify worker {} stopped", shared.name);
}

fn handle_batch<E, F>(shared: &Shared<E>, scratch: &mut Vec<E>, handler: &mut F)
where
    F: FnMut(E),
{
    {
        let mut buffer = shared.buffer.lock();
        std::mem::swap(&mut buffer.events, scratch);
    }

    for event in scratch.drain(..) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Notify worker {} handler panicked: {}", shared.name, msg);
        }
    }
}
