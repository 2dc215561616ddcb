//! # Endpointer
//!
//! Subscribes an [`EndpointCache`] to an [`Instancer`] and keeps it fed from
//! a background task.
use std::{fmt, sync::Arc};

use discovery::{Instancer, Snapshot, SubscriberId};
use relay_core::{DiscoveryError, Endpoint, Factory};
use tokio::{
    sync::mpsc::{self, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::{EndpointCache, EndpointerOptions};

/// Anything that can hand out the current set of endpoints.
pub trait Endpointer<Req, Resp>: Send + Sync {
    /// endpoints in address order, or the discovery failure that invalidated
    /// them
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, DiscoveryError>;
}

impl<Req, Resp, E> Endpointer<Req, Resp> for Arc<E>
where
    E: Endpointer<Req, Resp> + ?Sized,
{
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, DiscoveryError> {
        (**self).endpoints()
    }
}

impl<Req, Resp> Endpointer<Req, Resp> for EndpointCache<Req, Resp> {
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, DiscoveryError> {
        EndpointCache::endpoints(self)
    }
}

/// A fixed list of endpoints, no discovery involved.
pub struct FixedEndpointer<Req, Resp>(Arc<[Endpoint<Req, Resp>]>);

impl<Req, Resp> FixedEndpointer<Req, Resp> {
    /// endpointer always returning `endpoints`
    pub fn new(endpoints: Vec<Endpoint<Req, Resp>>) -> Self {
        Self(Arc::from(endpoints))
    }
}

impl<Req, Resp> fmt::Debug for FixedEndpointer<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FixedEndpointer").field(&self.0.len()).finish()
    }
}

impl<Req, Resp> Endpointer<Req, Resp> for FixedEndpointer<Req, Resp> {
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, DiscoveryError> {
        Ok(Arc::clone(&self.0))
    }
}

/// Keeps an [`EndpointCache`] in sync with an [`Instancer`].
///
/// The current snapshot is applied before `new` returns, later ones are
/// applied by a background task in the order the instancer produced them.
/// Dropping the endpointer closes it.
pub struct DefaultEndpointer<Req: 'static, Resp: 'static> {
    cache: Arc<EndpointCache<Req, Resp>>,
    instancer: Arc<dyn Instancer>,
    id: SubscriberId,
    // the registry only keeps a weak handle, this one keeps the channel open
    _tx: UnboundedSender<Snapshot>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl<Req, Resp> fmt::Debug for DefaultEndpointer<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultEndpointer")
            .field("id", &self.id)
            .field("cache", &self.cache)
            .finish()
    }
}

impl<Req, Resp> DefaultEndpointer<Req, Resp>
where
    Req: 'static,
    Resp: 'static,
{
    /// Subscribe to `instancer` and build endpoints with `factory`.
    pub fn new<I, F>(instancer: I, factory: F, options: EndpointerOptions) -> Self
    where
        I: Instancer + 'static,
        F: Factory<Req, Resp>,
    {
        let instancer: Arc<dyn Instancer> = Arc::new(instancer);
        let cache = Arc::new(EndpointCache::new(factory, options));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = instancer.register(&tx);
        // registration sends the current state synchronously
        while let Ok(snapshot) = rx.try_recv() {
            cache.update(snapshot);
        }

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let cache = Arc::clone(&cache);
            let token = token.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        snapshot = rx.recv() => match snapshot {
                            Some(snapshot) => {
                                trace!(?snapshot, "endpointer received snapshot");
                                cache.update(snapshot);
                            }
                            None => break,
                        },
                    }
                }
                debug!("endpointer task stopped");
            }
        });

        Self {
            cache,
            instancer,
            id,
            _tx: tx,
            token,
            task,
        }
    }

    /// Deregister from the instancer, stop the task and release every
    /// endpoint. Calling it again does nothing.
    pub fn close(&self) {
        self.token.cancel();
        self.instancer.deregister(self.id);
        self.cache.close();
    }

    /// true once the background task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<Req, Resp> Endpointer<Req, Resp> for DefaultEndpointer<Req, Resp> {
    fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, DiscoveryError> {
        self.cache.endpoints()
    }
}

impl<Req, Resp> Drop for DefaultEndpointer<Req, Resp> {
    fn drop(&mut self) {
        self.token.cancel();
        self.instancer.deregister(self.id);
        self.cache.close();
    }
}
