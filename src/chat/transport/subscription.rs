//! Fan-out of transport events to scoped subscribers.
//!
//! Every subscriber gets its own unbounded queue. Dropping the
//! [`Subscription`] removes it from the bus, so listeners registered by a
//! torn-down session never observe later events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::chat::transport::events::TransportEvent;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: DashMap<u64, mpsc::UnboundedSender<TransportEvent>>,
}

/// Broadcast bus for [`TransportEvent`]s.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.insert(id, tx);
        trace!(subscriber = id, "Subscribed");
        Subscription {
            id,
            rx,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Deliver an event to every live subscriber.
    pub fn publish(&self, event: &TransportEvent) {
        self.inner
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.inner.subscribers.len())
            .finish()
    }
}

/// Receiving end of an [`EventBus`] registration.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Wait for the next event. Cancel-safe.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subscribers.remove(&self.id);
        trace!(subscriber = self.id, "Unsubscribed");
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner")
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}
