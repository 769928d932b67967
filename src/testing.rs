//! In-memory cluster and Consul doubles shared by unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cluster::{Cluster, NodeEvent, ServiceEvent};
use crate::consul::{Agent, AgentConnector};
use crate::entry::ENABLED;
use crate::error::{Error, Result};
use crate::types::{
    AddressType, Node, NodeAddress, RegisteredService, RegistryEntry, Routing, Workload,
    WorkloadPort,
};

/// Node whose addresses are all internal IPs.
pub fn node(name: &str, internal: &[&str]) -> Node {
    Node {
        name: name.to_string(),
        addresses: internal
            .iter()
            .map(|a| NodeAddress {
                kind: AddressType::InternalIp,
                address: a.to_string(),
            })
            .collect(),
    }
}

/// Node with one internal and one external IP.
pub fn node_with_external(name: &str, internal: &str, external: &str) -> Node {
    let mut node = node(name, &[internal]);
    node.addresses.push(NodeAddress {
        kind: AddressType::ExternalIp,
        address: external.to_string(),
    });
    node
}

/// Enabled NodePort service with one TCP port.
pub fn node_port_service(name: &str, uid: &str, node_port: i32) -> Workload {
    Workload {
        namespace: "default".into(),
        name: name.into(),
        uid: uid.into(),
        annotations: BTreeMap::from([(ENABLED.to_string(), "true".to_string())]),
        labels: BTreeMap::new(),
        routing: Routing::NodePort,
        ports: vec![WorkloadPort {
            protocol: "TCP".into(),
            port: 80,
            node_port: Some(node_port),
        }],
        external_ips: vec![],
    }
}

#[derive(Default)]
struct ClusterState {
    services: Vec<Workload>,
    nodes: Vec<Node>,
    pod_hosts: Vec<String>,
    fail_services: bool,
    fail_nodes: bool,
    last_node_selector: Option<String>,
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn add_service(&self, workload: Workload) {
        self.state.lock().unwrap().services.push(workload);
    }

    pub fn remove_service(&self, uid: &str) {
        self.state.lock().unwrap().services.retain(|w| w.uid != uid);
    }

    pub fn add_node(&self, node: Node) {
        self.state.lock().unwrap().nodes.push(node);
    }

    pub fn remove_node(&self, name: &str) {
        self.state.lock().unwrap().nodes.retain(|n| n.name != name);
    }

    pub fn set_pod_hosts(&self, hosts: &[&str]) {
        self.state.lock().unwrap().pod_hosts = hosts.iter().map(|h| h.to_string()).collect();
    }

    pub fn fail_service_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_services = fail;
    }

    pub fn fail_node_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_nodes = fail;
    }

    pub fn last_node_selector(&self) -> Option<String> {
        self.state.lock().unwrap().last_node_selector.clone()
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn list_services(&self) -> Result<Vec<Workload>> {
        let state = self.state.lock().unwrap();
        if state.fail_services {
            return Err(Error::config("service listing unavailable"));
        }
        Ok(state.services.clone())
    }

    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<Node>> {
        let mut state = self.state.lock().unwrap();
        state.last_node_selector = selector.map(String::from);
        if state.fail_nodes {
            return Err(Error::config("node listing unavailable"));
        }
        Ok(state.nodes.clone())
    }

    async fn list_pod_hosts(&self, _selector: &str) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().pod_hosts.clone())
    }

    async fn watch_nodes(&self, _events: mpsc::Sender<NodeEvent>) -> Result<()> {
        Ok(())
    }

    async fn watch_services(&self, _events: mpsc::Sender<ServiceEvent>) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct ConsulState {
    /// agent host -> entry id -> entry
    agents: BTreeMap<String, BTreeMap<String, RegistryEntry>>,
    register_calls: usize,
    deregister_calls: usize,
    failing_ids: BTreeSet<String>,
    failing_hosts: BTreeSet<String>,
}

/// Shared registry behind every agent built by this connector.
#[derive(Clone, Default)]
pub struct FakeConsul {
    state: Arc<Mutex<ConsulState>>,
}

impl FakeConsul {
    /// Place an entry on an agent without going through the reconciler.
    pub fn seed(&self, host: &str, entry: RegistryEntry) {
        self.state
            .lock()
            .unwrap()
            .agents
            .entry(host.to_string())
            .or_default()
            .insert(entry.id.clone(), entry);
    }

    pub fn ids(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .agents
            .get(host)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entry(&self, host: &str, id: &str) -> Option<RegistryEntry> {
        self.state
            .lock()
            .unwrap()
            .agents
            .get(host)
            .and_then(|entries| entries.get(id).cloned())
    }

    pub fn register_calls(&self) -> usize {
        self.state.lock().unwrap().register_calls
    }

    pub fn deregister_calls(&self) -> usize {
        self.state.lock().unwrap().deregister_calls
    }

    pub fn fail_id(&self, id: &str) {
        self.state.lock().unwrap().failing_ids.insert(id.to_string());
    }

    pub fn fail_host(&self, host: &str) {
        self.state.lock().unwrap().failing_hosts.insert(host.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_ids.clear();
        state.failing_hosts.clear();
    }

    /// Drop an entry as an operator would from the Consul UI.
    pub fn remove(&self, host: &str, id: &str) {
        if let Some(entries) = self.state.lock().unwrap().agents.get_mut(host) {
            entries.remove(id);
        }
    }
}

impl AgentConnector for FakeConsul {
    fn connect(&self, host: &str) -> Arc<dyn Agent> {
        Arc::new(FakeAgent {
            host: host.to_string(),
            consul: self.clone(),
        })
    }
}

struct FakeAgent {
    host: String,
    consul: FakeConsul,
}

impl FakeAgent {
    fn failure(&self, id: &str) -> Error {
        Error::Consul {
            address: self.host.clone(),
            status: 500,
            body: format!("injected failure for {id}"),
        }
    }
}

#[async_trait]
impl Agent for FakeAgent {
    fn address(&self) -> &str {
        &self.host
    }

    async fn register(&self, entry: &RegistryEntry) -> Result<()> {
        let mut state = self.consul.state.lock().unwrap();
        state.register_calls += 1;
        if state.failing_ids.contains(&entry.id) {
            return Err(self.failure(&entry.id));
        }
        state
            .agents
            .entry(self.host.clone())
            .or_default()
            .insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let mut state = self.consul.state.lock().unwrap();
        state.deregister_calls += 1;
        if state.failing_ids.contains(id) {
            return Err(self.failure(id));
        }
        if let Some(entries) = state.agents.get_mut(&self.host) {
            entries.remove(id);
        }
        Ok(())
    }

    async fn services(&self) -> Result<Vec<RegisteredService>> {
        let state = self.consul.state.lock().unwrap();
        if state.failing_hosts.contains(&self.host) {
            return Err(self.failure("services"));
        }
        Ok(state
            .agents
            .get(&self.host)
            .map(|entries| {
                entries
                    .values()
                    .map(|e| RegisteredService {
                        id: e.id.clone(),
                        name: e.name.clone(),
                        address: e.address.clone(),
                        port: e.port,
                        tags: e.tags.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
