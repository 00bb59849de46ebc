//! Durability listeners are callbacks confirmed once the effects of an event
//! are guaranteed to be persisted.
//!
//! Listeners live in a side table owned by the partition's commit path and
//! are keyed by [`AttemptId`], never stored inside the event. A re-issued
//! event has a new attempt id and starts with no listeners.
//!
//! The registry guarantees each registration is confirmed at most once. It
//! cannot tell that an event was abandoned before commit: the commit path is
//! responsible for calling [`DurabilityListeners::discard`] for such events,
//! otherwise their listeners are never invoked.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::{
    error::Error,
    event::{AttemptId, EventId, Identified},
};

pub trait DurabilityListener: Send + Sync {
    /// Called exactly once, when the event is durably recorded.
    fn confirm_durable(&self, event: &EventId);
}

type ListenerSet = Vec<Arc<dyn DurabilityListener>>;

#[derive(Default)]
pub struct DurabilityListeners {
    listeners: Mutex<HashMap<AttemptId, ListenerSet>>,
}

impl DurabilityListeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<AttemptId, ListenerSet>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a listener to the event's listener set, creating the set if
    /// needed.
    pub fn register<E: Identified + ?Sized>(
        &self,
        event: &E,
        listener: Arc<dyn DurabilityListener>,
    ) {
        self.table().entry(event.attempt()).or_default().push(listener);
    }

    /// Confirms every listener registered on the event, then forgets them.
    /// Returns the number of listeners confirmed.
    pub fn confirm_all<E: Identified + ?Sized>(&self, event: &E) -> usize {
        // taken out of the table before invoking, so a second confirmation
        // finds nothing
        let listeners = self.table().remove(&event.attempt());
        let Some(listeners) = listeners else {
            return 0;
        };
        for listener in &listeners {
            listener.confirm_durable(event.event_id());
        }
        trace!(
            "confirmed {} durability listeners for {}",
            listeners.len(),
            event.event_id()
        );
        listeners.len()
    }

    /// Forgets the listeners of an event that will never be committed.
    pub fn discard<E: Identified + ?Sized>(&self, event: &E) -> usize {
        self.table()
            .remove(&event.attempt())
            .map_or(0, |listeners| listeners.len())
    }

    /// Number of events with at least one pending listener.
    pub fn pending(&self) -> usize {
        self.table().len()
    }
}

struct WaiterListener {
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl DurabilityListener for WaiterListener {
    fn confirm_durable(&self, _event: &EventId) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

/// A one-shot listener that a task can wait on.
pub struct DurabilityWaiter {
    event_id: EventId,
    rx: oneshot::Receiver<()>,
}

impl DurabilityWaiter {
    pub fn register<E: Identified + ?Sized>(
        registry: &DurabilityListeners,
        event: &E,
    ) -> Self {
        let (tx, rx) = oneshot::channel();
        registry.register(
            event,
            Arc::new(WaiterListener {
                tx: Mutex::new(Some(tx)),
            }),
        );
        Self {
            event_id: event.event_id().clone(),
            rx,
        }
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// Resolves once the event is confirmed durable. Fails if the listener is
    /// discarded first.
    pub async fn wait(self) -> Result<(), Error> {
        let Self { event_id, rx } = self;
        rx.await.map_err(|_| Error::Abandoned(event_id))
    }
}
