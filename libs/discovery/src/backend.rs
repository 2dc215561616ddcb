//! The contract a discovery backend must satisfy.
//!
//! A backend answers blocking queries: given the index of the last answer it
//! returned, it waits until something newer is available (or its own wait
//! time elapses) and returns the current addresses with a fresh index.
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::DiscoveryError;
use serde::{Deserialize, Serialize};

/// index meaning "no previous answer", the first query never blocks
pub const NO_INDEX: u64 = 0;

/// What to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceQuery {
    /// logical service name
    pub service: String,
    /// instances must carry every one of these tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// only return instances whose health checks pass
    #[serde(default)]
    pub passing_only: bool,
}

impl ServiceQuery {
    /// query for every instance of `service`
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Default::default()
        }
    }

    /// restrict to instances carrying all `tags`
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// restrict to healthy instances
    pub fn with_passing_only(mut self, passing_only: bool) -> Self {
        self.passing_only = passing_only;
        self
    }
}

/// Answer to a blocking query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryResult {
    /// `host:port` of every matching instance, in backend order
    pub instances: Vec<String>,
    /// freshness cursor of this answer
    pub index: u64,
}

/// A health check attached to a registration. Durations use the backend's
/// own notation, e.g. `"10s"`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthCheck {
    /// url polled over http
    #[serde(default)]
    pub http: Option<String>,
    /// `host:port` dialed over tcp
    #[serde(default)]
    pub tcp: Option<String>,
    /// how often the check runs
    pub interval: String,
    /// how long a single check may take
    #[serde(default)]
    pub timeout: Option<String>,
    /// remove the instance once critical for this long
    #[serde(default)]
    pub deregister_critical_service_after: Option<String>,
}

/// An instance as announced to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// unique instance id
    pub id: String,
    /// logical service name
    pub name: String,
    /// address the instance listens on
    pub address: String,
    /// port the instance listens on
    pub port: u16,
    /// tags used for filtering
    #[serde(default)]
    pub tags: Vec<String>,
    /// backend namespace, if any
    #[serde(default)]
    pub namespace: Option<String>,
    /// health check run by the backend
    #[serde(default)]
    pub check: Option<HealthCheck>,
}

impl Registration {
    /// new registration, id defaults to `name-address-port`
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        let address = address.into();
        Self {
            id: format!("{name}-{address}-{port}"),
            name,
            address,
            port,
            tags: Vec::new(),
            namespace: None,
            check: None,
        }
    }

    /// override the instance id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// set the tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// attach a health check
    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// `address:port`
    pub fn instance(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A discovery backend.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Blocking query for `query`. Returns once the backend's index moves
    /// past `last_index` or its wait time elapses. `NO_INDEX` never blocks.
    async fn query(
        &self,
        query: &ServiceQuery,
        last_index: u64,
    ) -> Result<QueryResult, DiscoveryError>;

    /// announce an instance
    async fn register(&self, registration: &Registration) -> Result<(), DiscoveryError>;

    /// withdraw an instance
    async fn deregister(&self, registration: &Registration) -> Result<(), DiscoveryError>;
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    async fn query(
        &self,
        query: &ServiceQuery,
        last_index: u64,
    ) -> Result<QueryResult, DiscoveryError> {
        (**self).query(query, last_index).await
    }

    async fn register(&self, registration: &Registration) -> Result<(), DiscoveryError> {
        (**self).register(registration).await
    }

    async fn deregister(&self, registration: &Registration) -> Result<(), DiscoveryError> {
        (**self).deregister(registration).await
    }
}
