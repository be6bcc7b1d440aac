//! Publish/subscribe bus for lifecycle events.
//!
//! Every subscriber owns an unbounded queue drained by its own delivery
//! task (or by the caller, for [`EventBus::subscribe_channel`]). Publishing
//! only pushes onto those queues, so it never blocks and a slow subscriber
//! cannot stall a supervisor or any other subscriber. Events of one device
//! reach each subscriber in publish order; nothing is coalesced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::event::LifecycleEvent;

/// Callback invoked for each delivered event.
pub type EventHandler = Box<dyn Fn(LifecycleEvent) + Send + Sync>;

/// Selects which devices a subscriber hears from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Events from every device.
    All,
    /// Events from one device ID.
    Device(String),
}

impl Filter {
    /// Shorthand for [`Filter::Device`].
    pub fn device(id: impl Into<String>) -> Self {
        Self::Device(id.into())
    }

    fn matches(&self, event: &LifecycleEvent) -> bool {
        match self {
            Self::All => true,
            Self::Device(id) => *id == event.device_id,
        }
    }
}

struct Subscriber {
    id: u64,
    filter: Filter,
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn add(&self, filter: Filter) -> (u64, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, filter, tx });
        (id, rx)
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id != id);
    }
}

/// Cloneable handle to a shared event bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for events matching `filter`.
    ///
    /// The callback runs on a dedicated tokio task, one event at a time, in
    /// publish order. Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, filter: Filter, handler: F) -> Subscription
    where
        F: Fn(LifecycleEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Box::new(handler);
        let (id, mut rx) = self.inner.add(filter);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
            trace!(subscriber = id, "delivery task finished");
        });
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            task: Some(task),
        }
    }

    /// Registers a subscriber and hands its queue to the caller.
    ///
    /// Dropping the receiver unsubscribes on the next publish.
    pub fn subscribe_channel(&self, filter: Filter) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        self.inner.add(filter).1
    }

    /// Queues an event for every matching subscriber and returns how many
    /// subscribers received it. Never blocks.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subs = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for sub in subs.iter().filter(|s| s.filter.matches(&event)) {
                match sub.tx.send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => closed.push(sub.id),
                }
            }
        }
        for id in closed {
            debug!(subscriber = id, "pruning closed subscriber");
            self.inner.remove(id);
        }
        trace!(device = %event.device_id, seq = event.seq, delivered, "published event");
        delivered
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes;
/// events already queued are still delivered.
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Unsubscribes and waits until every queued event has been handled.
    pub async fn finish(mut self) {
        self.detach();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn detach(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
