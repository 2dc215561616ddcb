//! Last known discovery state plus change notification.
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use crate::{
    event::Snapshot,
    registry::{Registry, SubscriberId},
};

/// Holds the latest [`Snapshot`] for a service and notifies subscribers when
/// it changes.
///
/// Every operation is serialized by one lock: `state` takes it shared,
/// `update`, `register` and `deregister` take it exclusively. Sends never
/// block, so no subscriber can stall the lock holder.
#[derive(Debug, Default)]
pub struct Cache {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Snapshot,
    reg: Registry,
}

impl Cache {
    /// empty cache, state is an empty address list
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `snapshot` and notify subscribers, unless it equals the current
    /// state. Returns whether anything changed.
    pub fn update(&self, mut snapshot: Snapshot) -> bool {
        snapshot.normalize();
        let mut guard = self.inner.write();
        if guard.state == snapshot {
            trace!("snapshot unchanged, skipping notification");
            return false;
        }
        debug!(?snapshot, "discovery state changed");
        let inner = &mut *guard;
        inner.state = snapshot;
        inner.reg.broadcast(&inner.state);
        true
    }

    /// copy of the current state
    pub fn state(&self) -> Snapshot {
        self.inner.read().state.clone()
    }

    /// Start notifying `tx`. The current state is sent right away so the
    /// subscriber does not wait for the next change.
    pub fn register(&self, tx: &UnboundedSender<Snapshot>) -> SubscriberId {
        let mut guard = self.inner.write();
        let id = guard.reg.register(tx);
        if tx.send(guard.state.clone()).is_err() {
            debug!(?id, "subscriber closed before initial state was sent");
        }
        id
    }

    /// Stop notifying the subscriber. Returns false if it was not registered.
    pub fn deregister(&self, id: SubscriberId) -> bool {
        self.inner.write().reg.deregister(id)
    }

    /// number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.read().reg.len()
    }
}
