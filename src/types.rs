//! Data structures used throughout the register daemon.
//!
//! Kubernetes objects are converted into these types at the cluster
//! boundary, so the reconciliation code only ever sees the fields it
//! consumes.  Registry entries are what gets sent to a Consul agent;
//! registered services are what an agent reports back.

use std::collections::BTreeMap;

/// How a workload can be reached from outside the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Reachable on every node through its node ports.
    NodePort,
    /// Reachable only on explicitly listed external addresses.
    ExternalIps,
    /// Not routable by this daemon (load balancers, external names).
    Other,
}

impl Routing {
    /// Map a Kubernetes service type. An unset type is ClusterIP.
    pub fn from_service_type(service_type: Option<&str>) -> Self {
        match service_type {
            Some("NodePort") => Routing::NodePort,
            Some("ClusterIP") | None => Routing::ExternalIps,
            Some(_) => Routing::Other,
        }
    }
}

/// A port declared by a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadPort {
    pub protocol: String,
    pub port: i32,
    pub node_port: Option<i32>,
}

impl WorkloadPort {
    pub fn is_tcp(&self) -> bool {
        self.protocol == "TCP"
    }
}

/// A cluster service as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub routing: Routing,
    pub ports: Vec<WorkloadPort>,
    pub external_ips: Vec<String>,
}

/// Address kinds reported in a node's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressType {
    InternalIp,
    ExternalIp,
    Other(String),
}

impl AddressType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "InternalIP" => AddressType::InternalIp,
            "ExternalIP" => AddressType::ExternalIp,
            other => AddressType::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub kind: AddressType,
    pub address: String,
}

/// A cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub addresses: Vec<NodeAddress>,
}

impl Node {
    /// Internal and external IPs, in status order.
    pub fn routable_addresses(&self) -> impl Iterator<Item = &str> {
        self.addresses
            .iter()
            .filter(|a| matches!(a.kind, AddressType::InternalIp | AddressType::ExternalIp))
            .map(|a| a.address.as_str())
    }
}

/// The kind of health check attached to a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckKind {
    Http(String),
    Tcp(String),
    Ttl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub kind: CheckKind,
    pub interval: String,
    pub timeout: String,
}

/// One reachable (address, port) instance of a workload, ready to be
/// registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: i32,
    pub tags: Vec<String>,
    pub check: HealthCheck,
}

/// A service as listed by a Consul agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredService {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: i32,
    pub tags: Vec<String>,
}

impl RegisteredService {
    /// True when `tag` appears verbatim in the tag list.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Value of the first `key:value` tag with the given key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.iter().find_map(|t| {
            t.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix(':'))
        })
    }
}
