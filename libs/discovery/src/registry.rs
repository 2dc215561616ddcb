//! Subscriber bookkeeping for a [`Cache`](crate::Cache).
use std::collections::HashMap;

use tokio::sync::mpsc::{UnboundedSender, WeakUnboundedSender};
use tracing::{debug, trace};

use crate::event::Snapshot;

/// Handle returned on registration, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

/// Every subscriber channel interested in changes. Only weak senders are kept:
/// the subscriber decides when its channel closes, never the registry.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    next_id: u64,
    subscribers: HashMap<SubscriberId, WeakUnboundedSender<Snapshot>>,
}

impl Registry {
    pub(crate) fn register(&mut self, tx: &UnboundedSender<Snapshot>) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers.insert(id, tx.downgrade());
        trace!(?id, "subscriber registered");
        id
    }

    pub(crate) fn deregister(&mut self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        trace!(?id, removed, "subscriber deregistered");
        removed
    }

    /// send an independent copy of `snapshot` to every subscriber. Channels
    /// whose owner has gone away are forgotten.
    pub(crate) fn broadcast(&mut self, snapshot: &Snapshot) {
        self.subscribers.retain(|id, weak| {
            let delivered = weak
                .upgrade()
                .is_some_and(|tx| tx.send(snapshot.clone()).is_ok());
            if !delivered {
                debug!(?id, "subscriber channel closed, dropping it");
            }
            delivered
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.len()
    }
}
