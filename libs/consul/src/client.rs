//! Consul agent client.
//!
//! Talks to the agent's http api with blocking queries on the health
//! endpoint. ACL token and datacenter are optional.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use discovery::{Backend, QueryResult, Registration, ServiceQuery};
use relay_core::DiscoveryError;
use reqwest::{header::HeaderMap, Method, RequestBuilder, Response};
use tracing::{debug, trace};

use crate::{
    error::{ConsulError, ConsulResult},
    models::{filter_entries, make_instances, AgentServiceRegistration, ServiceEntry},
};

/// Default consul agent address.
pub const DEFAULT_ADDR: &str = "http://127.0.0.1:8500";

/// Default time a blocking query may park on the agent.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(300);

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Slack on top of `wait` before the http request itself times out. The agent
/// adds up to wait/16 of jitter to blocking queries.
const REQUEST_SLACK: Duration = Duration::from_secs(5);

/// How to reach the consul agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulConfig {
    /// agent base url
    pub addr: String,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
    /// datacenter sent as `dc`
    pub datacenter: Option<String>,
    /// how long blocking queries may park
    pub wait: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_owned(),
            token: None,
            datacenter: None,
            wait: DEFAULT_WAIT,
        }
    }
}

/// Consul [`Backend`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    config: Arc<ConsulConfig>,
}

impl ConsulClient {
    /// build a client, no connection is made until the first call
    pub fn new(config: ConsulConfig) -> ConsulResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ConsulError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    /// the configuration in use
    pub fn config(&self) -> &ConsulConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.config.addr.trim_end_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self.http.request(method, self.url(path));
        if let Some(token) = &self.config.token {
            req = req.header(TOKEN_HEADER, token);
        }
        if let Some(dc) = &self.config.datacenter {
            req = req.query(&[("dc", dc)]);
        }
        req
    }

    /// `GET /v1/health/service/{service}`, blocking on `index` unless it is
    /// zero. Returns the entries and the agent's new index.
    pub async fn health_service(
        &self,
        query: &ServiceQuery,
        index: u64,
    ) -> ConsulResult<(Vec<ServiceEntry>, u64)> {
        let wait = self.config.wait;
        let mut req = self
            .request(Method::GET, &format!("health/service/{}", query.service))
            .timeout(wait + wait / 16 + REQUEST_SLACK);
        if index != 0 {
            req = req.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}ms", wait.as_millis())),
            ]);
        }
        if query.passing_only {
            req = req.query(&[("passing", "true")]);
        }
        if let Some(tag) = query.tags.first() {
            req = req.query(&[("tag", tag)]);
        }

        trace!(service = %query.service, index, "consul health query");
        let resp = check_status(req.send().await?).await?;
        let new_index = parse_index(resp.headers())?;
        let entries: Vec<ServiceEntry> = resp.json().await?;
        debug!(service = %query.service, index = new_index, entries = entries.len(), "consul health answer");
        Ok((entries, new_index))
    }

    /// `PUT /v1/agent/service/register`
    pub async fn register_service(&self, registration: &Registration) -> ConsulResult<()> {
        let body = AgentServiceRegistration::from(registration);
        let resp = self
            .request(Method::PUT, "agent/service/register")
            .json(&body)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    /// `PUT /v1/agent/service/deregister/{id}`
    pub async fn deregister_service(&self, id: &str) -> ConsulResult<()> {
        let resp = self
            .request(Method::PUT, &format!("agent/service/deregister/{id}"))
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for ConsulClient {
    async fn query(
        &self,
        query: &ServiceQuery,
        last_index: u64,
    ) -> Result<QueryResult, DiscoveryError> {
        let (entries, index) = self.health_service(query, last_index).await?;
        let entries = filter_entries(entries, &query.tags);
        Ok(QueryResult {
            instances: make_instances(&entries),
            index,
        })
    }

    async fn register(&self, registration: &Registration) -> Result<(), DiscoveryError> {
        Ok(self.register_service(registration).await?)
    }

    async fn deregister(&self, registration: &Registration) -> Result<(), DiscoveryError> {
        Ok(self.deregister_service(&registration.id).await?)
    }
}

async fn check_status(resp: Response) -> ConsulResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(ConsulError::Status {
        code: status.as_u16(),
        message: message.trim().to_owned(),
    })
}

/// A missing header reads as index 0, which the watcher treats as an anomaly.
fn parse_index(headers: &HeaderMap) -> ConsulResult<u64> {
    match headers.get(INDEX_HEADER) {
        None => Ok(0),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ConsulError::InvalidIndex(format!("{value:?}"))),
    }
}
