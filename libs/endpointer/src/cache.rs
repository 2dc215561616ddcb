//! # EndpointCache
//!
//! Turns discovery snapshots into a list of ready [`Endpoint`]s, one per
//! address. Entries survive across snapshots as long as their address does,
//! so a connection behind an endpoint is built once and released once.
//!
//! When discovery fails the cache can keep serving the last good list for a
//! grace period before giving up, see [`EndpointerOptions`].
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use discovery::Snapshot;
use parking_lot::RwLock;
use relay_core::{
    metrics::{ENDPOINT_BUILDS, ENDPOINT_BUILD_FAILURES, ENDPOINT_RELEASES},
    DiscoveryError, Endpoint, Factory, Release,
};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How the cache reacts to discovery failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointerOptions {
    /// drop the endpoints once discovery has been failing for
    /// `invalidate_timeout`; when false failures are ignored and the last
    /// good list is served forever
    pub invalidate_on_error: bool,
    /// grace period before the endpoints are dropped
    pub invalidate_timeout: Duration,
}

impl EndpointerOptions {
    /// invalidate the endpoints `timeout` after discovery starts failing
    pub fn invalidate_on_error(timeout: Duration) -> Self {
        Self {
            invalidate_on_error: true,
            invalidate_timeout: timeout,
        }
    }
}

struct Entry<Req, Resp> {
    endpoint: Endpoint<Req, Resp>,
    release: Option<Box<dyn Release>>,
}

struct Resolved<Req, Resp> {
    cache: HashMap<String, Entry<Req, Resp>>,
    endpoints: Arc<[Endpoint<Req, Resp>]>,
    err: Option<DiscoveryError>,
    invalidate_deadline: Option<Instant>,
    purged: bool,
    closed: bool,
}

impl<Req, Resp> Default for Resolved<Req, Resp> {
    fn default() -> Self {
        Self {
            cache: HashMap::new(),
            endpoints: Arc::from(Vec::new()),
            err: None,
            invalidate_deadline: None,
            purged: false,
            closed: false,
        }
    }
}

impl<Req, Resp> Resolved<Req, Resp> {
    /// the current list is still good to hand out
    fn serving(&self, now: Instant) -> bool {
        match (&self.err, self.invalidate_deadline) {
            (None, _) => true,
            (Some(_), Some(deadline)) => now < deadline,
            (Some(_), None) => false,
        }
    }
}

/// Resources handed back by a reconcile, to be released once the lock is
/// gone.
type Released = Vec<(String, Box<dyn Release>)>;

/// Per-address endpoint cache fed by discovery snapshots.
pub struct EndpointCache<Req: 'static, Resp: 'static> {
    factory: Box<dyn Factory<Req, Resp>>,
    options: EndpointerOptions,
    inner: RwLock<Resolved<Req, Resp>>,
}

impl<Req, Resp> fmt::Debug for EndpointCache<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("EndpointCache")
            .field("options", &self.options)
            .field("endpoints", &inner.endpoints.len())
            .field("err", &inner.err)
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<Req, Resp> EndpointCache<Req, Resp> {
    /// empty cache building endpoints with `factory`
    pub fn new<F>(factory: F, options: EndpointerOptions) -> Self
    where
        F: Factory<Req, Resp>,
    {
        Self {
            factory: Box::new(factory),
            options,
            inner: RwLock::new(Resolved::default()),
        }
    }

    /// Apply a discovery snapshot.
    pub fn update(&self, snapshot: Snapshot) {
        match snapshot {
            Snapshot::Failure(err) => self.record_error(err),
            Snapshot::Instances(mut addrs) => {
                addrs.sort_unstable();
                addrs.dedup();
                let released = {
                    let mut inner = self.inner.write();
                    if inner.closed {
                        trace!("endpoint cache closed, ignoring snapshot");
                        return;
                    }
                    let released = self.reconcile(&mut inner, &addrs);
                    inner.err = None;
                    inner.invalidate_deadline = None;
                    inner.purged = false;
                    released
                };
                release_all(released);
            }
        }
    }

    fn record_error(&self, err: DiscoveryError) {
        if !self.options.invalidate_on_error {
            debug!(?err, "discovery failed, keeping last known endpoints");
            return;
        }
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        if inner.err.is_some() {
            // first error wins until a good snapshot clears it
            trace!(?err, "discovery error already pending");
            return;
        }
        let deadline = Instant::now() + self.options.invalidate_timeout;
        debug!(?err, timeout = ?self.options.invalidate_timeout, "discovery failed, endpoints will be invalidated");
        inner.err = Some(err);
        inner.invalidate_deadline = Some(deadline);
    }

    /// Make the cache hold exactly `addrs`: keep known entries, build new
    /// ones, hand back the resources of entries that went away.
    fn reconcile(&self, inner: &mut Resolved<Req, Resp>, addrs: &[String]) -> Released {
        let mut next = HashMap::with_capacity(addrs.len());
        for addr in addrs {
            if let Some(entry) = inner.cache.remove(addr) {
                next.insert(addr.clone(), entry);
                continue;
            }
            match self.factory.build(addr) {
                Ok((endpoint, release)) => {
                    ENDPOINT_BUILDS.inc();
                    debug!(%addr, "built endpoint");
                    next.insert(addr.clone(), Entry { endpoint, release });
                }
                Err(err) => {
                    ENDPOINT_BUILD_FAILURES.inc();
                    warn!(%addr, ?err, "failed to build endpoint, skipping address");
                }
            }
        }

        let removed = std::mem::replace(&mut inner.cache, next);
        inner.endpoints = addrs
            .iter()
            .filter_map(|addr| inner.cache.get(addr).map(|e| e.endpoint.clone()))
            .collect();

        removed
            .into_iter()
            .filter_map(|(addr, entry)| entry.release.map(|r| (addr, r)))
            .collect()
    }

    /// Current endpoints in address order.
    ///
    /// While discovery is healthy, or failing for less than the grace period,
    /// this is the last good list. Afterwards every entry is released and the
    /// pending discovery error is returned until a good snapshot arrives.
    pub fn endpoints(&self) -> Result<Arc<[Endpoint<Req, Resp>]>, DiscoveryError> {
        {
            let inner = self.inner.read();
            if inner.serving(Instant::now()) {
                return Ok(Arc::clone(&inner.endpoints));
            }
            if inner.purged {
                if let Some(err) = &inner.err {
                    return Err(err.clone());
                }
            }
        }

        let (err, released) = {
            let mut inner = self.inner.write();
            // someone may have beaten us to it between the two locks
            if inner.serving(Instant::now()) {
                return Ok(Arc::clone(&inner.endpoints));
            }
            let released = if inner.purged {
                Vec::new()
            } else {
                debug!(err = ?inner.err, "grace period over, dropping endpoints");
                inner.purged = true;
                self.reconcile(&mut inner, &[])
            };
            (inner.err.clone(), released)
        };
        release_all(released);
        match err {
            Some(err) => Err(err),
            None => Ok(Arc::from(Vec::new())),
        }
    }

    /// Release every entry and ignore further snapshots.
    pub fn close(&self) {
        let released = {
            let mut inner = self.inner.write();
            inner.closed = true;
            self.reconcile(&mut inner, &[])
        };
        release_all(released);
    }

    /// number of cached entries
    pub fn len(&self) -> usize {
        self.inner.read().cache.len()
    }

    /// true if no entries are cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn release_all(released: Released) {
    for (addr, release) in released {
        ENDPOINT_RELEASES.inc();
        debug!(%addr, "releasing endpoint");
        release.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use relay_core::{anyhow, endpoint::Built, release_fn, Factory};
    use tracing_test::traced_test;

    #[derive(Debug, Default)]
    struct Counts {
        built: AtomicUsize,
        released: AtomicUsize,
    }

    /// factory whose endpoints answer with their own address
    fn factory(counts: Arc<Counts>) -> impl Factory<(), String> {
        move |addr: &str| -> anyhow::Result<Built<(), String>> {
            counts.built.fetch_add(1, Ordering::SeqCst);
            let owned = addr.to_owned();
            let endpoint = Endpoint::new(move |_req: ()| {
                let addr = owned.clone();
                async move { Ok(addr) }
            });
            let counts = Arc::clone(&counts);
            let release = release_fn(move || {
                counts.released.fetch_add(1, Ordering::SeqCst);
            });
            Ok((endpoint, Some(release)))
        }
    }

    async fn addrs(cache: &EndpointCache<(), String>) -> Vec<String> {
        let mut out = Vec::new();
        for ep in cache.endpoints().unwrap().iter() {
            out.push(ep.call(()).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_reconcile_keeps_existing() {
        let counts = Arc::new(Counts::default());
        let cache = EndpointCache::new(factory(counts.clone()), EndpointerOptions::default());

        cache.update(Snapshot::instances(["b:1", "a:1"]));
        assert_eq!(addrs(&cache).await, vec!["a:1", "b:1"]);
        let before = cache.endpoints().unwrap();

        cache.update(Snapshot::instances(["b:1", "c:1"]));
        assert_eq!(addrs(&cache).await, vec!["b:1", "c:1"]);
        assert_eq!(counts.built.load(Ordering::SeqCst), 3);
        assert_eq!(counts.released.load(Ordering::SeqCst), 1);

        let after = cache.endpoints().unwrap();
        assert!(before[1].same_endpoint(&after[0]));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_factory_failure_skips_address() {
        let cache = EndpointCache::new(
            |addr: &str| -> anyhow::Result<Built<(), String>> {
                if addr.starts_with("bad") {
                    anyhow::bail!("cannot dial {addr}");
                }
                let owned = addr.to_owned();
                Ok((
                    Endpoint::new(move |_req: ()| {
                        let addr = owned.clone();
                        async move { Ok(addr) }
                    }),
                    None,
                ))
            },
            EndpointerOptions::default(),
        );
        cache.update(Snapshot::instances(["a:1", "bad:1", "c:1"]));
        assert_eq!(addrs(&cache).await, vec!["a:1", "c:1"]);
        assert!(logs_contain("failed to build endpoint"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_ignored_without_invalidation() {
        let cache = EndpointCache::new(
            factory(Arc::new(Counts::default())),
            EndpointerOptions::default(),
        );
        cache.update(Snapshot::instances(["a:1"]));
        cache.update(Snapshot::failure(DiscoveryError::Transport("down".into())));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(cache.endpoints().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window() {
        let counts = Arc::new(Counts::default());
        let cache = EndpointCache::new(
            factory(counts.clone()),
            EndpointerOptions::invalidate_on_error(Duration::from_secs(5)),
        );
        cache.update(Snapshot::instances(["a:1", "b:1"]));
        let err = DiscoveryError::Transport("down".into());
        cache.update(Snapshot::failure(err.clone()));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(addrs(&cache).await, vec!["a:1", "b:1"]);

        // a second error does not push the deadline back
        cache.update(Snapshot::failure(DiscoveryError::Transport("still down".into())));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.endpoints().unwrap_err(), err);
        assert_eq!(counts.released.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());

        // purged once only
        assert_eq!(cache.endpoints().unwrap_err(), err);
        assert_eq!(counts.released.load(Ordering::SeqCst), 2);

        // recovery clears the error and rebuilds
        cache.update(Snapshot::instances(["a:1"]));
        assert_eq!(addrs(&cache).await, vec!["a:1"]);
        assert_eq!(counts.built.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_readers_purge_once() {
        const READERS: usize = 8;
        let counts = Arc::new(Counts::default());
        let cache = EndpointCache::new(
            factory(counts.clone()),
            EndpointerOptions::invalidate_on_error(Duration::from_millis(1)),
        );
        cache.update(Snapshot::instances(["a:1", "b:1", "c:1"]));
        let err = DiscoveryError::Transport("down".into());
        cache.update(Snapshot::failure(err.clone()));
        std::thread::sleep(Duration::from_millis(20));

        let barrier = std::sync::Barrier::new(READERS);
        let results: Vec<_> = std::thread::scope(|s| {
            let readers: Vec<_> = (0..READERS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        cache.endpoints()
                    })
                })
                .collect();
            readers.into_iter().map(|r| r.join().unwrap()).collect()
        });

        for res in results {
            assert_eq!(res.unwrap_err(), err);
        }
        assert_eq!(counts.built.load(Ordering::SeqCst), 3);
        assert_eq!(counts.released.load(Ordering::SeqCst), 3);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_and_ignores_updates() {
        let counts = Arc::new(Counts::default());
        let cache = EndpointCache::new(factory(counts.clone()), EndpointerOptions::default());
        cache.update(Snapshot::instances(["a:1", "b:1"]));
        cache.close();
        assert_eq!(counts.released.load(Ordering::SeqCst), 2);
        cache.update(Snapshot::instances(["c:1"]));
        assert!(cache.is_empty());
        assert_eq!(counts.built.load(Ordering::SeqCst), 2);
    }
}
