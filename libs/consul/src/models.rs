//! Wire models for the consul http api and the conversions to and from the
//! discovery types.

use discovery::{HealthCheck, Registration};
use serde::{Deserialize, Serialize};

/// One entry of `GET /v1/health/service/{service}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    /// node the instance runs on
    pub node: Node,
    /// the instance itself
    pub service: AgentService,
}

/// A consul node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    /// node name
    #[serde(default)]
    pub node: String,
    /// node address
    #[serde(default)]
    pub address: String,
}

/// A service instance as consul reports it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    /// instance id
    #[serde(rename = "ID", default)]
    pub id: String,
    /// service name
    #[serde(default)]
    pub service: String,
    /// consul sends `null` for no tags
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// service address, empty means "use the node address"
    #[serde(default)]
    pub address: String,
    /// service port
    #[serde(default)]
    pub port: u16,
}

/// Body of `PUT /v1/agent/service/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub port: u16,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<AgentServiceCheck>,
}

/// Health check attached to a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceCheck {
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    pub interval: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deregister_critical_service_after: Option<String>,
}

impl From<&HealthCheck> for AgentServiceCheck {
    fn from(check: &HealthCheck) -> Self {
        Self {
            http: check.http.clone(),
            tcp: check.tcp.clone(),
            interval: check.interval.clone(),
            timeout: check.timeout.clone(),
            deregister_critical_service_after: check.deregister_critical_service_after.clone(),
        }
    }
}

impl From<&Registration> for AgentServiceRegistration {
    fn from(reg: &Registration) -> Self {
        Self {
            id: reg.id.clone(),
            name: reg.name.clone(),
            tags: reg.tags.clone(),
            port: reg.port,
            address: reg.address.clone(),
            namespace: reg.namespace.clone(),
            check: reg.check.as_ref().map(AgentServiceCheck::from),
        }
    }
}

/// Keep entries carrying every tag. The first tag was already sent to the
/// agent as the `tag` parameter, so only the rest are checked here.
pub fn filter_entries(entries: Vec<ServiceEntry>, tags: &[String]) -> Vec<ServiceEntry> {
    if tags.len() <= 1 {
        return entries;
    }
    entries
        .into_iter()
        .filter(|entry| {
            let have = entry.service.tags.as_deref().unwrap_or_default();
            tags[1..].iter().all(|want| have.contains(want))
        })
        .collect()
}

/// `address:port` for every entry, falling back to the node address when the
/// service does not advertise its own.
pub fn make_instances(entries: &[ServiceEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let addr = if entry.service.address.is_empty() {
                &entry.node.address
            } else {
                &entry.service.address
            };
            format!("{addr}:{}", entry.service.port)
        })
        .collect()
}
