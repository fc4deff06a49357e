//! Bounded, per-job event bus.
//!
//! Every active run gets its own [`Dispatcher`] (spec Section 4.5): a bounded
//! `mpsc` channel feeding a single dispatch task that fans events out to
//! subscribers synchronously, in the order they were registered. `emit` never
//! blocks the producer — when the buffer is full the event is dropped and a
//! warning is logged, rather than applying backpressure to the worker or
//! scheduler that raised it. A subscriber that panics is caught and logged;
//! the remaining subscribers still see the event.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use loop_core::Event;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Default bounded capacity for a per-job event bus (spec Section 4.5).
pub const DEFAULT_CAPACITY: usize = 1000;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Something that wants to observe every event raised by a run.
pub trait Subscriber: Send + Sync {
    /// Handle one event. Implementations should not block for long; the
    /// dispatcher delivers events to every subscriber synchronously before
    /// moving on to the next event in the channel.
    fn on_event<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, ()>;
}

/// A bounded, non-blocking event bus for a single run.
///
/// Cloning a `Dispatcher` shares the same channel and dispatch task; the
/// last clone to call [`Dispatcher::close`] drains the channel and joins the
/// dispatch task, after which further `close` calls are no-ops.
#[derive(Clone)]
pub struct Dispatcher {
    tx: Arc<Mutex<Option<mpsc::Sender<Event>>>>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Dispatcher {
    /// Spawn a dispatch task fanning out to `subscribers`, in the order given.
    pub fn spawn(subscribers: Vec<Arc<dyn Subscriber>>) -> Self {
        Self::spawn_with_capacity(subscribers, DEFAULT_CAPACITY)
    }

    /// Same as [`Dispatcher::spawn`] with an explicit channel capacity.
    pub fn spawn_with_capacity(subscribers: Vec<Arc<dyn Subscriber>>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity);

        let join = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for subscriber in &subscribers {
                    let fut = subscriber.on_event(&event);
                    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                        Ok(()) => {}
                        Err(panic) => {
                            let msg = panic_message(&panic);
                            error!(
                                event_type = %event.event_type,
                                sequence = event.sequence,
                                error = %msg,
                                "event subscriber panicked"
                            );
                        }
                    }
                }
            }
        });

        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            join: Arc::new(Mutex::new(Some(join))),
        }
    }

    /// Publish an event without blocking. Drops and warns if the buffer is
    /// full or the dispatch task has already exited.
    pub async fn emit(&self, event: Event) {
        let guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            warn!(event_type = %event.event_type, "event bus closed; dropping event");
            return;
        };
        if let Err(err) = tx.try_send(event) {
            match err {
                mpsc::error::TrySendError::Full(event) => {
                    warn!(
                        event_type = %event.event_type,
                        "event bus buffer full; dropping event"
                    );
                }
                mpsc::error::TrySendError::Closed(event) => {
                    warn!(
                        event_type = %event.event_type,
                        "event bus dispatch task gone; dropping event"
                    );
                }
            }
        }
    }

    /// Stop accepting new events, let the dispatch task drain whatever is
    /// already buffered, and wait for it to exit. Safe to call more than
    /// once; only the first call does anything.
    pub async fn close(&self) {
        let tx = self.tx.lock().await.take();
        drop(tx);

        let handle = self.join.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "event dispatch task exited abnormally");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
