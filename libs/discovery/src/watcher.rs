//! # Watcher
//!
//! Keeps a [`Cache`] in sync with a discovery [`Backend`] by running blocking
//! queries in a loop. The loop lives on its own task; every query runs on yet
//! another task so that [`Instancer::stop`] can interrupt it mid-flight.
use std::sync::Arc;

use relay_core::{
    metrics::{DISCOVERY_ANOMALIES, DISCOVERY_ERRORS, DISCOVERY_UPDATES},
    Backoff, DiscoveryError,
};
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    backend::{Backend, QueryResult, ServiceQuery, NO_INDEX},
    cache::Cache,
    event::Snapshot,
    registry::SubscriberId,
};

/// Source of discovery snapshots that consumers can subscribe to.
pub trait Instancer: Send + Sync {
    /// start receiving snapshots on `tx`, the current one is sent immediately
    fn register(&self, tx: &UnboundedSender<Snapshot>) -> SubscriberId;
    /// stop sending to the subscriber
    fn deregister(&self, id: SubscriberId) -> bool;
    /// current snapshot
    fn state(&self) -> Snapshot;
    /// stop producing snapshots
    fn stop(&self);
}

impl Instancer for Cache {
    fn register(&self, tx: &UnboundedSender<Snapshot>) -> SubscriberId {
        Cache::register(self, tx)
    }

    fn deregister(&self, id: SubscriberId) -> bool {
        Cache::deregister(self, id)
    }

    fn state(&self) -> Snapshot {
        Cache::state(self)
    }

    fn stop(&self) {}
}

impl<I: Instancer + ?Sized> Instancer for Arc<I> {
    fn register(&self, tx: &UnboundedSender<Snapshot>) -> SubscriberId {
        (**self).register(tx)
    }

    fn deregister(&self, id: SubscriberId) -> bool {
        (**self).deregister(id)
    }

    fn state(&self) -> Snapshot {
        (**self).state()
    }

    fn stop(&self) {
        (**self).stop()
    }
}

/// Watches one service on a backend. Dropping the watcher stops it.
#[derive(Debug)]
pub struct Watcher {
    cache: Arc<Cache>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Watcher {
    /// Query the backend once to seed the cache, then keep watching in the
    /// background with the default backoff schedule.
    pub async fn new<B: Backend + ?Sized>(backend: Arc<B>, query: ServiceQuery) -> Self {
        Self::with_backoff(backend, query, Backoff::default()).await
    }

    /// like [`Watcher::new`] with a custom backoff schedule
    pub async fn with_backoff<B: Backend + ?Sized>(
        backend: Arc<B>,
        query: ServiceQuery,
        backoff: Backoff,
    ) -> Self {
        let cache = Arc::new(Cache::new());
        let token = CancellationToken::new();

        let (snapshot, index) = match backend.query(&query, NO_INDEX).await {
            Ok(res) => {
                debug!(service = %query.service, instances = res.instances.len(), index = res.index, "initial discovery query");
                (Snapshot::instances(res.instances), res.index)
            }
            Err(err) => {
                DISCOVERY_ERRORS.inc();
                debug!(service = %query.service, ?err, "initial discovery query failed");
                (Snapshot::failure(err), NO_INDEX)
            }
        };
        cache.update(snapshot);

        let watch = WatchLoop {
            cache: Arc::clone(&cache),
            backend,
            query: Arc::new(query),
            token: token.clone(),
            backoff,
        };
        let task = tokio::spawn(watch.run(index));

        Self { cache, token, task }
    }

    /// true once the background loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Instancer for Watcher {
    fn register(&self, tx: &UnboundedSender<Snapshot>) -> SubscriberId {
        self.cache.register(tx)
    }

    fn deregister(&self, id: SubscriberId) -> bool {
        self.cache.deregister(id)
    }

    fn state(&self) -> Snapshot {
        self.cache.state()
    }

    fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct WatchLoop<B: ?Sized> {
    cache: Arc<Cache>,
    backend: Arc<B>,
    query: Arc<ServiceQuery>,
    token: CancellationToken,
    backoff: Backoff,
}

impl<B: Backend + ?Sized> WatchLoop<B> {
    #[instrument(name = "watch", level = "debug", skip_all, fields(service = %self.query.service))]
    async fn run(mut self, mut last_index: u64) {
        loop {
            let Some(res) = self.fetch(last_index).await else {
                debug!("discovery watch stopped");
                return;
            };
            match res {
                Err(err) => {
                    DISCOVERY_ERRORS.inc();
                    debug!(?err, "discovery query failed");
                    // first error wins, no storm of failure snapshots
                    if !self.cache.state().is_failure() {
                        self.cache.update(Snapshot::failure(err));
                    }
                    // the next answer must not block on, or be dropped for,
                    // an index we already saw before the failure
                    last_index = NO_INDEX;
                }
                Ok(QueryResult { index, .. }) if index == NO_INDEX => {
                    DISCOVERY_ANOMALIES.inc();
                    warn!("index is not sane");
                }
                Ok(QueryResult { index, .. }) if index < last_index => {
                    DISCOVERY_ANOMALIES.inc();
                    warn!(index, last_index, "index is less than previous; resetting to default");
                    last_index = NO_INDEX;
                }
                Ok(QueryResult { index, .. }) if index == last_index => {
                    DISCOVERY_ANOMALIES.inc();
                    debug!(index, "index unchanged");
                }
                Ok(QueryResult { instances, index }) => {
                    debug!(index, instances = instances.len(), "discovery query returned");
                    last_index = index;
                    if self.cache.update(Snapshot::instances(instances)) {
                        DISCOVERY_UPDATES.inc();
                    }
                    self.backoff.reset();
                    continue;
                }
            }
            if !self.sleep().await {
                debug!("discovery watch stopped during backoff");
                return;
            }
        }
    }

    /// Run one query on its own task, racing the stop signal. `None` means we
    /// were stopped, whatever the query returns later is discarded.
    async fn fetch(&self, last_index: u64) -> Option<Result<QueryResult, DiscoveryError>> {
        let backend = Arc::clone(&self.backend);
        let query = Arc::clone(&self.query);
        let mut handle = tokio::spawn(async move { backend.query(&query, last_index).await });

        tokio::select! {
            _ = self.token.cancelled() => {
                handle.abort();
                None
            }
            res = &mut handle => Some(res.unwrap_or_else(|err| {
                Err(DiscoveryError::Transport(format!("discovery query task failed: {err}")))
            })),
        }
    }

    /// sleep for the current backoff delay, false if stopped meanwhile
    async fn sleep(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    use crate::{backend::Registration, memory::MemoryBackend};

    /// replays scripted answers, then blocks forever
    #[derive(Debug, Default)]
    struct Scripted {
        answers: Mutex<Vec<Result<QueryResult, DiscoveryError>>>,
        calls: AtomicU64,
    }

    impl Scripted {
        fn new(mut answers: Vec<Result<QueryResult, DiscoveryError>>) -> Arc<Self> {
            answers.reverse();
            Arc::new(Self {
                answers: Mutex::new(answers),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Backend for Scripted {
        async fn query(
            &self,
            _query: &ServiceQuery,
            _last_index: u64,
        ) -> Result<QueryResult, DiscoveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.answers.lock().pop();
            match next {
                Some(answer) => answer,
                None => std::future::pending().await,
            }
        }

        async fn register(&self, _registration: &Registration) -> Result<(), DiscoveryError> {
            Ok(())
        }

        async fn deregister(&self, _registration: &Registration) -> Result<(), DiscoveryError> {
            Ok(())
        }
    }

    fn ok(instances: &[&str], index: u64) -> Result<QueryResult, DiscoveryError> {
        Ok(QueryResult {
            instances: instances.iter().map(|s| s.to_string()).collect(),
            index,
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Snapshot>) -> Vec<Snapshot> {
        let mut out = Vec::new();
        while let Ok(snap) = rx.try_recv() {
            out.push(snap);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_initial_query_seeds_state() {
        let backend = Scripted::new(vec![ok(&["b:1", "a:1"], 5)]);
        let watcher = Watcher::new(backend, ServiceQuery::new("users")).await;
        assert_eq!(watcher.state(), Snapshot::instances(["a:1", "b:1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_failure_is_published() {
        let err = DiscoveryError::Transport("refused".into());
        let backend = Scripted::new(vec![Err(err.clone())]);
        let watcher = Watcher::new(backend, ServiceQuery::new("users")).await;
        assert_eq!(watcher.state(), Snapshot::failure(err));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_newer_index_is_published() {
        let backend = Scripted::new(vec![ok(&["a:1"], 1), ok(&["a:1", "b:1"], 2)]);
        let watcher = Watcher::new(backend, ServiceQuery::new("users")).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.register(&tx);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let seen = drain(&mut rx);
        assert_eq!(seen.last(), Some(&Snapshot::instances(["a:1", "b:1"])));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_stale_index_not_published() {
        let backend = Scripted::new(vec![
            ok(&["a:1"], 5),
            ok(&["x:1"], 5),
            ok(&["y:1"], 0),
            ok(&["z:1"], 3),
        ]);
        let watcher = Watcher::new(backend.clone(), ServiceQuery::new("users")).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
        assert_eq!(watcher.state(), Snapshot::instances(["a:1"]));
        assert!(logs_contain("index is not sane"));
        assert!(logs_contain("resetting to default"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_errors_publish_once() {
        let backend = Scripted::new(vec![
            ok(&["a:1"], 1),
            Err(DiscoveryError::Transport("first".into())),
            Err(DiscoveryError::Transport("second".into())),
            Err(DiscoveryError::Transport("third".into())),
        ]);
        let watcher = Watcher::new(backend.clone(), ServiceQuery::new("users")).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.register(&tx);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
        let seen = drain(&mut rx);
        assert_eq!(
            seen,
            vec![
                Snapshot::instances(["a:1"]),
                Snapshot::failure(DiscoveryError::Transport("first".into())),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_error() {
        let backend = Scripted::new(vec![
            ok(&["a:1"], 1),
            Err(DiscoveryError::Transport("down".into())),
            ok(&["b:1"], 2),
        ]);
        let watcher = Watcher::new(backend, ServiceQuery::new("users")).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(watcher.state(), Snapshot::instances(["b:1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_with_unchanged_index() {
        let backend = Scripted::new(vec![
            ok(&["a:1"], 7),
            Err(DiscoveryError::Transport("blip".into())),
            ok(&["a:1"], 7),
        ]);
        let watcher = Watcher::new(backend.clone(), ServiceQuery::new("users")).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.register(&tx);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(watcher.state(), Snapshot::instances(["a:1"]));
        assert_eq!(
            drain(&mut rx),
            vec![
                Snapshot::instances(["a:1"]),
                Snapshot::failure(DiscoveryError::Transport("blip".into())),
                Snapshot::instances(["a:1"]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_backend_blip_recovers() {
        let backend = Arc::new(MemoryBackend::new().with_wait(Duration::from_secs(5)));
        backend.set_instances("users", ["10.0.0.1:9"]);
        let watcher = Watcher::new(backend.clone(), ServiceQuery::new("users")).await;

        backend.set_failure(Some(DiscoveryError::Transport("blip".into())));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(watcher.state().is_failure());

        // catalog untouched, so the index stays where it was
        let index = backend.index();
        backend.set_failure(None);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.index(), index);
        assert_eq!(watcher.state(), Snapshot::instances(["10.0.0.1:9"]));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_stop_interrupts_blocking_query() {
        let backend = Scripted::new(vec![ok(&["a:1"], 1)]);
        let watcher = Watcher::new(backend, ServiceQuery::new("users")).await;
        // the loop is now parked in a query that never returns
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!watcher.is_finished());
        watcher.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(watcher.is_finished());
        assert_eq!(watcher.state(), Snapshot::instances(["a:1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_memory_backend() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_instances("users", ["10.0.0.1:9"]);
        let watcher = Watcher::new(backend.clone(), ServiceQuery::new("users")).await;
        assert_eq!(watcher.state(), Snapshot::instances(["10.0.0.1:9"]));

        backend.set_instances("users", ["10.0.0.2:9", "10.0.0.1:9"]);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            watcher.state(),
            Snapshot::instances(["10.0.0.1:9", "10.0.0.2:9"])
        );

        watcher.stop();
        tokio::time::sleep(Duration::from_millis(1)).await;
        backend.set_instances("users", ["10.0.0.3:9"]);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            watcher.state(),
            Snapshot::instances(["10.0.0.1:9", "10.0.0.2:9"])
        );
    }
}
