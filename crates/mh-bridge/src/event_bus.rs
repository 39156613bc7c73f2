use std::sync::{Arc, Mutex};

use crate::protocol::{ConductorEvent, EventKind};

/// Default per-subscriber queue depth.
const QUEUE_CAPACITY: usize = 256;

struct Subscriber {
    filter: Option<EventKind>,
    tx: flume::Sender<ConductorEvent>,
    // Kept so the publisher can evict the oldest event when the queue is
    // full (flume channels are MPMC; the receiver side is cloneable).
    rx: flume::Receiver<ConductorEvent>,
}

/// A broadcast-style event bus built on bounded flume channels.
///
/// Each subscription gets its own queue; a slow subscriber never blocks the
/// publisher. When a queue overflows, the oldest event is dropped and the
/// loss is logged — on-disk state, not the event stream, is the source of
/// truth. The bus is thread-safe and cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Subscriber>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    /// Register a subscriber that receives every event published from this
    /// point forward.
    pub fn subscribe_all(&self) -> flume::Receiver<ConductorEvent> {
        self.subscribe_inner(None)
    }

    /// Register a subscriber that receives only events of the given kind.
    pub fn subscribe(&self, kind: EventKind) -> flume::Receiver<ConductorEvent> {
        self.subscribe_inner(Some(kind))
    }

    fn subscribe_inner(&self, filter: Option<EventKind>) -> flume::Receiver<ConductorEvent> {
        let (tx, rx) = flume::bounded(self.capacity);
        let mut subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.push(Subscriber {
            filter,
            tx,
            rx: rx.clone(),
        });
        rx
    }

    /// Publish an event to all matching subscribers, in registration order.
    ///
    /// Disconnected subscribers are pruned; full queues drop their oldest
    /// event to admit the new one.
    pub fn publish(&self, event: ConductorEvent) {
        let kind = event.kind();
        let mut subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.retain(|sub| {
            if sub.filter.is_some_and(|f| f != kind) {
                return !sub.tx.is_disconnected();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(ev)) => {
                    let _ = sub.rx.try_recv();
                    tracing::warn!(kind = ?kind, "event queue full, dropped oldest event");
                    match sub.tx.try_send(ev) {
                        Ok(()) | Err(flume::TrySendError::Full(_)) => true,
                        Err(flume::TrySendError::Disconnected(_)) => false,
                    }
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("EventBus lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
