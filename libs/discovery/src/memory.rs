//! In-process discovery backend.
//!
//! Holds registrations in memory and answers blocking queries off a
//! [`tokio::sync::watch`] channel, so a query parked on an old index wakes as
//! soon as anything changes. Useful in tests and for running without a
//! discovery server.
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::DiscoveryError;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::backend::{Backend, QueryResult, Registration, ServiceQuery, NO_INDEX};

/// In-memory [`Backend`]. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<watch::Sender<State>>,
    wait: Option<Duration>,
    queries: Arc<AtomicU64>,
    scripted: Arc<Mutex<VecDeque<DiscoveryError>>>,
}

#[derive(Debug, Clone)]
struct State {
    index: u64,
    entries: BTreeMap<String, Entry>,
    failure: Option<DiscoveryError>,
}

#[derive(Debug, Clone)]
struct Entry {
    service: String,
    addr: String,
    tags: Vec<String>,
    passing: bool,
}

impl State {
    fn matching(&self, query: &ServiceQuery) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.service == query.service)
            .filter(|e| !query.passing_only || e.passing)
            .filter(|e| query.tags.iter().all(|t| e.tags.contains(t)))
            .map(|e| e.addr.clone())
            .collect()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// empty backend, index starts at 1
    pub fn new() -> Self {
        let (tx, _) = watch::channel(State {
            index: 1,
            entries: BTreeMap::new(),
            failure: None,
        });
        Self {
            state: Arc::new(tx),
            wait: None,
            queries: Arc::new(AtomicU64::new(0)),
            scripted: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Give up on a blocking query after `wait` and return the unchanged
    /// index, the way a remote backend's wait timeout behaves.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Replace every instance of `service` with `addrs` (`host:port`).
    pub fn set_instances<I, S>(&self, service: &str, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addrs: Vec<String> = addrs.into_iter().map(Into::into).collect();
        self.modify(|state| {
            state.entries.retain(|_, e| e.service != service);
            for addr in addrs {
                state.entries.insert(
                    format!("{service}-{addr}"),
                    Entry {
                        service: service.to_owned(),
                        addr,
                        tags: Vec::new(),
                        passing: true,
                    },
                );
            }
        });
    }

    /// Mark the instance with `id` healthy or not. Returns false if unknown.
    pub fn set_passing(&self, id: &str, passing: bool) -> bool {
        let mut found = false;
        self.modify(|state| {
            if let Some(entry) = state.entries.get_mut(id) {
                entry.passing = passing;
                found = true;
            }
        });
        found
    }

    /// Make every query fail with `err` until cleared with `None`. Parked
    /// queries fail right away.
    pub fn set_failure(&self, err: Option<DiscoveryError>) {
        self.state.send_modify(|state| state.failure = err);
    }

    /// Fail the next query with `err`, once. Queued failures are used up in
    /// order before the regular state is consulted again.
    pub fn fail_next(&self, err: DiscoveryError) {
        self.scripted.lock().push_back(err);
    }

    /// current index
    pub fn index(&self) -> u64 {
        self.state.borrow().index
    }

    /// how many queries have been answered or started
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    fn modify(&self, f: impl FnOnce(&mut State)) {
        self.state.send_modify(|state| {
            f(state);
            state.index += 1;
            trace!(index = state.index, "memory backend changed");
        });
    }

    async fn wait_for_change(
        &self,
        query: &ServiceQuery,
        last_index: u64,
    ) -> Result<QueryResult, DiscoveryError> {
        let mut rx = self.state.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if let Some(err) = &state.failure {
                    return Err(err.clone());
                }
                if last_index == NO_INDEX || state.index > last_index {
                    return Ok(QueryResult {
                        instances: state.matching(query),
                        index: state.index,
                    });
                }
            }
            if rx.changed().await.is_err() {
                return Err(DiscoveryError::Stopped);
            }
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn query(
        &self,
        query: &ServiceQuery,
        last_index: u64,
    ) -> Result<QueryResult, DiscoveryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let scripted = self.scripted.lock().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        match self.wait {
            None => self.wait_for_change(query, last_index).await,
            Some(wait) => {
                match tokio::time::timeout(wait, self.wait_for_change(query, last_index)).await {
                    Ok(res) => res,
                    Err(_) => {
                        let state = self.state.borrow();
                        Ok(QueryResult {
                            instances: state.matching(query),
                            index: state.index,
                        })
                    }
                }
            }
        }
    }

    async fn register(&self, registration: &Registration) -> Result<(), DiscoveryError> {
        debug!(id = %registration.id, "registering instance in memory");
        self.modify(|state| {
            state.entries.insert(
                registration.id.clone(),
                Entry {
                    service: registration.name.clone(),
                    addr: registration.instance(),
                    tags: registration.tags.clone(),
                    passing: true,
                },
            );
        });
        Ok(())
    }

    async fn deregister(&self, registration: &Registration) -> Result<(), DiscoveryError> {
        debug!(id = %registration.id, "deregistering instance in memory");
        self.modify(|state| {
            state.entries.remove(&registration.id);
        });
        Ok(())
    }
}
