//! Bounded, asynchronous notifications.
//!
//! A [`Notifier`] owns a fixed-size queue and one dispatcher running on the
//! blocking pool. Handlers are registered up front through [`NotifierBuilder`]
//! and run on the dispatcher, never on the task that published the event, so a
//! slow handler cannot hold up the async workers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::error::{ComputeError, Result};
use crate::models::{FaultEvent, PackageDescriptor};

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Raised once per failed health probe.
pub type ContainerFaulted = Notifier<FaultEvent>;

/// Raised when package discovery yields a valid descriptor.
pub type ValidPackageFound = Notifier<PackageDescriptor>;

pub struct NotifierBuilder<E> {
    name: &'static str,
    capacity: usize,
    handlers: Vec<Handler<E>>,
}

impl<E: Send + 'static> NotifierBuilder<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            capacity: DEFAULT_QUEUE_CAPACITY,
            handlers: Vec::new(),
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn subscribe<F>(mut self, handler: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Start the dispatcher. Must be called from within a tokio runtime.
    pub fn start(self) -> Notifier<E> {
        let (tx, mut rx) = mpsc::channel::<E>(self.capacity);
        let handlers = self.handlers;
        let name = self.name;

        let dispatcher = tokio::task::spawn_blocking(move || {
            while let Some(event) = rx.blocking_recv() {
                for handler in &handlers {
                    if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                        tracing::error!(notifier = name, "event handler panicked");
                    }
                }
            }
            tracing::debug!(notifier = name, "dispatcher drained");
        });

        Notifier {
            name,
            tx: Some(tx),
            dispatcher: Some(dispatcher),
        }
    }
}

pub struct Notifier<E> {
    name: &'static str,
    tx: Option<mpsc::Sender<E>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl<E: Send + 'static> Notifier<E> {
    pub fn builder(name: &'static str) -> NotifierBuilder<E> {
        NotifierBuilder::new(name)
    }

    /// Queue an event. Waits for room when the queue is full.
    pub async fn publish(&self, event: E) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(ComputeError::Cancelled)?;
        tx.send(event).await.map_err(|_| {
            tracing::warn!(notifier = self.name, "dispatcher is gone, event dropped");
            ComputeError::Cancelled
        })
    }

    /// Queue an event without waiting. Returns false if the queue is full and
    /// the event was dropped.
    pub fn try_publish(&self, event: E) -> Result<bool> {
        let tx = self.tx.as_ref().ok_or(ComputeError::Cancelled)?;
        match tx.try_send(event) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(notifier = self.name, "queue full, event dropped");
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => Err(ComputeError::Cancelled),
        }
    }

    /// Close the queue and wait until every queued event was handled.
    pub async fn shutdown(&mut self) {
        self.tx.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                tracing::error!(notifier = self.name, error = %e, "dispatcher task failed");
            }
        }
    }
}
