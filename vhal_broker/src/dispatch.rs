//! Single-consumer dispatch of vehicle notifications.
//!
//! Channel callbacks can arrive on any transport thread. They are turned into
//! [`DispatchMessage`]s, pushed onto an `mpsc` queue and drained by exactly one
//! named worker thread, which is the only thread that ever runs service event
//! handlers.
//!
//! ```text
//!  transport threads          vhal-dispatch thread
//!  ┌───────────────┐  mpsc   ┌────────────────────────┐
//!  │ QueueCallback │ ──────► │ worker loop            │──► HalListener
//!  └───────────────┘         │  Events / Set / Error  │
//!                            │  Barrier → ack         │
//!                            └────────────────────────┘
//! ```
//!
//! Every callback is stamped with the channel generation it was created for.
//! [`DispatchQueue::next_generation`] retires all earlier callbacks: whatever
//! they enqueue afterwards, or had enqueued and was not yet drained, is
//! dropped by the worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vhal_common::consts::DISPATCH_THREAD_NAME;
use vhal_common::hal::{ChannelCallback, HalError, StatusCode};
use vhal_common::property::{AreaId, PropertyId, PropertyValue};

/// Receiver side of dispatched notifications.
pub trait HalListener: Send + Sync {
    /// Batch of property change events, in transport order.
    fn on_property_events(&self, values: Vec<PropertyValue>);

    /// Acknowledgement of a value written by this side.
    fn on_property_set(&self, value: PropertyValue);

    /// An asynchronous write failed.
    fn on_property_set_error(&self, status: StatusCode, prop: PropertyId, area: AreaId);
}

/// Notification received from a vehicle channel.
#[derive(Debug)]
pub enum ChannelNotification {
    /// Event batch.
    Events(Vec<PropertyValue>),
    /// Set acknowledgement.
    PropertySet(PropertyValue),
    /// Set failure.
    SetError {
        /// Status reported by the vehicle.
        status: StatusCode,
        /// Property.
        prop: PropertyId,
        /// Area.
        area: AreaId,
    },
}

/// Work item of the dispatch thread.
#[derive(Debug)]
pub enum DispatchMessage {
    /// Channel notification, tagged with the generation of its callback.
    Channel {
        /// Channel generation the callback belongs to.
        generation: u64,
        /// Payload.
        notification: ChannelNotification,
    },
    /// Acknowledged once everything queued before it has been handled.
    Barrier(Sender<()>),
    /// Stop the worker.
    Shutdown,
}

/// `ChannelCallback` that only enqueues.
struct QueueCallback {
    sender: Sender<DispatchMessage>,
    generation: u64,
}

impl QueueCallback {
    fn push(&self, notification: ChannelNotification) {
        let message = DispatchMessage::Channel {
            generation: self.generation,
            notification,
        };
        if self.sender.send(message).is_err() {
            debug!("Dispatch queue closed, dropping notification");
        }
    }
}

impl ChannelCallback for QueueCallback {
    fn on_property_event(&self, values: Vec<PropertyValue>) {
        self.push(ChannelNotification::Events(values));
    }

    fn on_property_set(&self, value: PropertyValue) {
        self.push(ChannelNotification::PropertySet(value));
    }

    fn on_property_set_error(&self, status: StatusCode, prop: PropertyId, area: AreaId) {
        self.push(ChannelNotification::SetError { status, prop, area });
    }
}

/// Owner of the dispatch queue and its worker thread.
pub struct DispatchQueue {
    sender: Sender<DispatchMessage>,
    receiver: Mutex<Option<Receiver<DispatchMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Mutex<Option<ThreadId>>,
    generation: Arc<AtomicU64>,
}

impl DispatchQueue {
    /// Create the queue. Nothing is drained until [`start`](Self::start).
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            worker_id: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the worker. The listener is held weakly so the queue never keeps
    /// its owner alive; once the listener is gone the worker exits.
    ///
    /// # Errors
    /// `HalError::InitFailed` if already started or the thread cannot spawn.
    pub fn start(&self, listener: Weak<dyn HalListener>) -> Result<(), HalError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| HalError::InitFailed("dispatch queue already started".to_string()))?;

        let generation = Arc::clone(&self.generation);
        let handle = thread::Builder::new()
            .name(DISPATCH_THREAD_NAME.to_string())
            .spawn(move || run_worker(receiver, listener, generation))
            .map_err(|e| HalError::InitFailed(format!("cannot spawn dispatch thread: {e}")))?;

        *self.worker_id.lock() = Some(handle.thread().id());
        *self.worker.lock() = Some(handle);
        info!("Dispatch thread '{}' started", DISPATCH_THREAD_NAME);
        Ok(())
    }

    /// A channel callback of the current generation.
    pub fn callback(&self) -> Arc<dyn ChannelCallback> {
        self.callback_for(self.generation.load(Ordering::Acquire))
    }

    /// Retire every callback handed out so far and return one of the new
    /// generation.
    pub fn next_generation(&self) -> Arc<dyn ChannelCallback> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, "Dispatch generation advanced");
        self.callback_for(generation)
    }

    fn callback_for(&self, generation: u64) -> Arc<dyn ChannelCallback> {
        Arc::new(QueueCallback {
            sender: self.sender.clone(),
            generation,
        })
    }

    /// Enqueue a message directly.
    pub fn post(&self, message: DispatchMessage) {
        if self.sender.send(message).is_err() {
            debug!("Dispatch queue closed, dropping message");
        }
    }

    /// Block until every notification queued before this call was handled.
    ///
    /// Returns immediately when called from the dispatch thread itself or
    /// when the worker is not running.
    pub fn sync(&self) {
        if *self.worker_id.lock() == Some(thread::current().id()) {
            return;
        }
        if self.worker.lock().is_none() {
            return;
        }
        let (ack_tx, ack_rx) = mpsc::channel();
        self.post(DispatchMessage::Barrier(ack_tx));
        if ack_rx.recv().is_err() {
            debug!("Dispatch worker gone before barrier was reached");
        }
    }

    /// True while the worker thread is running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the worker after it drained what is already queued.
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        self.post(DispatchMessage::Shutdown);
        if handle.thread().id() == thread::current().id() {
            // Stopping from a handler: the loop sees Shutdown after returning.
            return;
        }
        if handle.join().is_err() {
            warn!("Dispatch thread panicked");
        }
        info!("Dispatch thread stopped");
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    receiver: Receiver<DispatchMessage>,
    listener: Weak<dyn HalListener>,
    current: Arc<AtomicU64>,
) {
    while let Ok(message) = receiver.recv() {
        let (generation, notification) = match message {
            DispatchMessage::Barrier(ack) => {
                let _ = ack.send(());
                continue;
            }
            DispatchMessage::Shutdown => break,
            DispatchMessage::Channel {
                generation,
                notification,
            } => (generation, notification),
        };

        if generation < current.load(Ordering::Acquire) {
            debug!(generation, "Dropping notification from a retired channel");
            continue;
        }

        let Some(listener) = listener.upgrade() else {
            debug!("Dispatch listener dropped, worker exiting");
            break;
        };

        match notification {
            ChannelNotification::Events(values) => listener.on_property_events(values),
            ChannelNotification::PropertySet(value) => listener.on_property_set(value),
            ChannelNotification::SetError { status, prop, area } => {
                listener.on_property_set_error(status, prop, area)
            }
        }
    }
}
