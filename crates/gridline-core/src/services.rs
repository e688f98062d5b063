//! Service resolver: service name to `host:port`.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{ParseError, RoutingError};
use crate::feed::{FeedIndex, Indexed, RawRecord};

/// Port preferred when a service exposes several.
const PREFERRED_PORT: &str = "http";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServicePort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub identity: String,
    pub name: String,
    /// `None` for headless services and services not yet assigned an address.
    pub cluster_ip: Option<String>,
    pub ports: Vec<ServicePort>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceSpec {
    #[serde(rename = "clusterIP", default)]
    cluster_ip: Option<String>,
    #[serde(default)]
    ports: Vec<ServicePort>,
}

impl ServiceDescriptor {
    /// A port named `http`, else the first one declared.
    pub fn select_port(&self) -> Option<&ServicePort> {
        self.ports
            .iter()
            .find(|p| p.name.as_deref() == Some(PREFERRED_PORT))
            .or_else(|| self.ports.first())
    }

    pub fn address(&self) -> Result<String, RoutingError> {
        let host = self
            .cluster_ip
            .as_deref()
            .ok_or_else(|| RoutingError::NoClusterAddress(self.name.clone()))?;
        let port = self
            .select_port()
            .ok_or_else(|| RoutingError::NoPort(self.name.clone()))?;
        Ok(join_host_port(host, port.port))
    }
}

impl Indexed for ServiceDescriptor {
    fn parse(record: &RawRecord) -> Result<Self, ParseError> {
        let name = record.payload["metadata"]["name"]
            .as_str()
            .ok_or(ParseError::MissingField("metadata.name"))?
            .to_string();
        let spec = ServiceSpec::deserialize(&record.payload["spec"]).map_err(|e| {
            ParseError::Record {
                identity: record.identity.clone(),
                reason: format!("spec: {}", e),
            }
        })?;
        let cluster_ip = spec
            .cluster_ip
            .filter(|ip| !ip.is_empty() && ip != "None");
        Ok(Self {
            identity: record.identity.clone(),
            name,
            cluster_ip,
            ports: spec.ports,
        })
    }

    fn index_key(&self) -> &str {
        &self.name
    }
}

/// `host:port`, with IPv6 hosts in brackets.
pub fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Read side of the service index, as the dispatcher sees it.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, service: &str) -> Result<String, RoutingError>;
}

/// Shared handle to the service index.
#[derive(Clone, Default)]
pub struct ServiceResolver {
    inner: Arc<FeedIndex<ServiceDescriptor>>,
}

impl ServiceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self) -> Arc<FeedIndex<ServiceDescriptor>> {
        Arc::clone(&self.inner)
    }

    pub fn list(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.inner.list()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    pub async fn wait_ready(&self) {
        self.inner.wait_ready().await
    }
}

impl AddressResolver for ServiceResolver {
    fn resolve(&self, service: &str) -> Result<String, RoutingError> {
        self.inner.lookup(service)?.address()
    }
}
