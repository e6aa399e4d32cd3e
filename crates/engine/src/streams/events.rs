//! Workshop event broker.
//!
//! Pub/sub keyed by workshop ID: many long-lived observers, small bounded
//! buffers, non-blocking publish that skips (never waits on) a slow
//! subscriber. Structurally the same fan-out discipline as the stream
//! registry, but multicast instead of single-consumer.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use fabula_domain::{WorkshopEvent, WorkshopId};

/// Buffered events per subscriber; workshop events are low-volume.
const SUBSCRIBER_BUFFER_SIZE: usize = 16;

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<WorkshopEvent>,
}

/// One observer's end of a workshop's event feed.
///
/// Dropping the subscription deregisters it, so a vanished SSE client
/// cleans up after itself.
pub struct Subscription {
    broker: std::sync::Arc<WorkshopEventBroker>,
    workshop_id: WorkshopId,
    id: Uuid,
    rx: mpsc::Receiver<WorkshopEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<WorkshopEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.workshop_id, self.id);
    }
}

/// Process-wide broker, constructed once and injected.
///
/// Uses a std `RwLock` (operations never await while holding it) so
/// unsubscription can run from `Drop`.
#[derive(Default)]
pub struct WorkshopEventBroker {
    subscribers: RwLock<HashMap<WorkshopId, Vec<Subscriber>>>,
}

impl WorkshopEventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for a workshop's events.
    pub fn subscribe(self: &std::sync::Arc<Self>, workshop_id: WorkshopId) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        let id = Uuid::new_v4();
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(workshop_id)
            .or_default()
            .push(Subscriber { id, tx });

        Subscription {
            broker: std::sync::Arc::clone(self),
            workshop_id,
            id,
            rx,
        }
    }

    fn unsubscribe(&self, workshop_id: WorkshopId, id: Uuid) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subscribers.get_mut(&workshop_id) {
            list.retain(|subscriber| subscriber.id != id);
            if list.is_empty() {
                subscribers.remove(&workshop_id);
            }
        }
    }

    /// Deliver an event to every current subscriber of a workshop,
    /// skipping any whose buffer is full. Publishing to a workshop with
    /// no subscribers is a no-op.
    pub fn publish(&self, workshop_id: WorkshopId, event: WorkshopEvent) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subscribers.get(&workshop_id) else {
            return;
        };
        let mut skipped = 0usize;
        for subscriber in list {
            if subscriber.tx.try_send(event.clone()).is_err() {
                skipped += 1;
            }
        }
        if skipped > 0 {
            tracing::debug!(
                workshop_id = %workshop_id,
                skipped,
                "skipped slow workshop event subscribers"
            );
        }
    }

    pub fn subscriber_count(&self, workshop_id: WorkshopId) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&workshop_id)
            .map_or(0, Vec::len)
    }
}
