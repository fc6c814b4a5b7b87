//! Fan-out of a lineage's latest QR payload and status.
//!
//! The hub retains one snapshot. New subscribers receive that snapshot
//! and then live events, never history. Publishing never blocks: a
//! subscriber whose queue is full is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use credlink_protocol::{LinkStatus, ObserverEvent};

pub type SubscriberId = u64;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HubSnapshot {
    pub qr: Option<String>,
    pub status: Option<LinkStatus>,
}

struct Slot {
    tx: mpsc::Sender<ObserverEvent>,
    last_qr: Option<String>,
    last_status: Option<LinkStatus>,
}

impl Slot {
    /// Records `event` as delivered. Returns `false` if it repeats the
    /// previous delivery of the same kind.
    fn mark(&mut self, event: &ObserverEvent) -> bool {
        match event {
            ObserverEvent::Qr(value) => {
                if self.last_qr.as_deref() == Some(value.as_str()) {
                    return false;
                }
                self.last_qr = Some(value.clone());
                // The next status is news again, even if it repeats.
                self.last_status = None;
            }
            ObserverEvent::Status(status) => {
                if self.last_status == Some(*status) {
                    return false;
                }
                self.last_status = Some(*status);
                // A new status invalidates the displayed QR.
                self.last_qr = None;
            }
        }
        true
    }
}

struct HubInner {
    snapshot: HubSnapshot,
    subscribers: HashMap<SubscriberId, Slot>,
    next_id: SubscriberId,
    buffer: usize,
}

/// Cheap-to-clone handle to one lineage's broadcast hub.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<Mutex<HubInner>>,
}

impl BroadcastHub {
    /// Creates a hub whose subscribers each get a queue of `buffer` events.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                snapshot: HubSnapshot::default(),
                subscribers: HashMap::new(),
                next_id: 1,
                buffer: buffer.max(2),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an observer and enqueues the retained snapshot, status
    /// first.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::channel(inner.buffer);
        let id = inner.next_id;
        inner.next_id += 1;

        let mut slot = Slot {
            tx,
            last_qr: None,
            last_status: None,
        };
        let snapshot = inner.snapshot.clone();
        let initial = snapshot
            .status
            .map(ObserverEvent::Status)
            .into_iter()
            .chain(snapshot.qr.map(ObserverEvent::Qr));
        for event in initial {
            if slot.mark(&event) {
                // The queue is fresh and holds at least two events.
                let _ = slot.tx.try_send(event);
            }
        }
        inner.subscribers.insert(id, slot);
        debug!(subscriber = id, total = inner.subscribers.len(), "observer attached");

        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Detaches an observer. Returns whether anything was removed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.lock().subscribers.remove(&id).is_some();
        if removed {
            debug!(subscriber = id, "observer detached");
        }
        removed
    }

    /// Overwrites the snapshot and forwards the event to every subscriber.
    pub fn publish(&self, event: ObserverEvent) {
        let mut inner = self.lock();
        match &event {
            ObserverEvent::Qr(value) => inner.snapshot.qr = Some(value.clone()),
            ObserverEvent::Status(status) => {
                inner.snapshot.status = Some(*status);
                inner.snapshot.qr = None;
            }
        }

        inner.subscribers.retain(|id, slot| {
            if !slot.mark(&event) {
                return true;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = *id, "observer queue full, dropping subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn snapshot(&self) -> HubSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// A live observer attachment. Dropping it detaches the observer.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<ObserverEvent>,
    hub: Weak<Mutex<HubInner>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next event. Returns `None` once the hub has dropped
    /// this subscriber or gone away.
    pub async fn recv(&mut self) -> Option<ObserverEvent> {
        self.rx.recv().await
    }

    /// Returns a queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ObserverEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.subscribers.remove(&self.id);
        }
    }
}
