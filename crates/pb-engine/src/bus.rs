//! Event bus — per-run publish/subscribe for live observers.
//!
//! Subscriptions are keyed by run id. Publishing to a run with no
//! subscribers drops the event: the bus is for live observation, not an
//! audit log; durable history belongs to the store.

use pb_core::event::RunEvent;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

type EventHandler = Arc<dyn Fn(&RunEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    /// Per-run subscriber lists, in registration order. Entries are removed
    /// when the last subscriber for a run unsubscribes.
    subscribers: Mutex<HashMap<Uuid, Vec<(u64, EventHandler)>>>,
    next_token: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for all events of `run_id`. Dropping the returned
    /// subscription unsubscribes.
    pub fn subscribe(
        self: &Arc<Self>,
        run_id: Uuid,
        handler: impl Fn(&RunEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber map mutex poisoned")
            .entry(run_id)
            .or_default()
            .push((token, Arc::new(handler)));
        Subscription {
            bus: Arc::clone(self),
            run_id,
            token,
        }
    }

    /// Register a channel-forwarding subscriber for streaming transports
    /// (SSE/WebSocket adapters). Events arrive in publish order.
    pub fn subscribe_channel(
        self: &Arc<Self>,
        run_id: Uuid,
    ) -> (Subscription, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(run_id, move |event| {
            // Receiver dropped means the transport went away; the
            // subscription itself is cleaned up by its own drop.
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Deliver `event` to all subscribers of its run, synchronously and in
    /// registration order. No subscribers means the event is dropped.
    pub fn publish(&self, event: &RunEvent) {
        let handlers: Vec<EventHandler> = {
            let subscribers = self
                .subscribers
                .lock()
                .expect("subscriber map mutex poisoned");
            match subscribers.get(&event.run_id) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };

        for handler in handlers {
            // One misbehaving subscriber must not break delivery to the rest.
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(
                    run_id = %event.run_id,
                    kind = event.kind.as_str(),
                    "event subscriber panicked; continuing delivery"
                );
            }
        }
    }

    /// Number of live subscribers for a run.
    pub fn subscriber_count(&self, run_id: Uuid) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber map mutex poisoned")
            .get(&run_id)
            .map_or(0, Vec::len)
    }

    fn unsubscribe(&self, run_id: Uuid, token: u64) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("subscriber map mutex poisoned");
        if let Some(list) = subscribers.get_mut(&run_id) {
            list.retain(|(t, _)| *t != token);
            if list.is_empty() {
                subscribers.remove(&run_id);
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

/// RAII handle for one subscription; unsubscribes on drop.
pub struct Subscription {
    bus: Arc<EventBus>,
    run_id: Uuid,
    token: u64,
}

impl Subscription {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Explicit unsubscribe; equivalent to dropping.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.run_id, self.token);
    }
}
