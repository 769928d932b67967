//! Consul agent resolution.
//!
//! Every reconciliation pass starts by resolving the set of agents it
//! will talk to.  The set is keyed the way the targeting mode names
//! agents (static address, node name or pod host IP) and carries an
//! index from every target address to the agent that serves it, so both
//! full passes and single-workload registration pick agents the same way.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use log::debug;

use crate::cluster::Cluster;
use crate::config::{Config, RegisterMode};
use crate::consul::{Agent, AgentConnector};
use crate::error::Result;
use crate::types::{AddressType, Node};

/// Agents resolved for one reconciliation pass.
#[derive(Default, Clone)]
pub struct AgentSet {
    agents: BTreeMap<String, Arc<dyn Agent>>,
    owners: HashMap<String, String>,
    /// Single mode: the agent that serves every address.
    catch_all: Option<String>,
}

impl AgentSet {
    fn insert(&mut self, key: String, agent: Arc<dyn Agent>) {
        self.agents.insert(key, agent);
    }

    fn index(&mut self, address: impl Into<String>, key: &str) {
        self.owners.insert(address.into(), key.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn Agent>> {
        self.agents.get(key)
    }

    /// The agent responsible for entries targeting `address`.
    pub fn for_address(&self, address: &str) -> Option<&Arc<dyn Agent>> {
        self.owners
            .get(address)
            .or(self.catch_all.as_ref())
            .and_then(|key| self.agents.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Agent>)> {
        self.agents.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.agents.iter().map(|(k, v)| (k, v.address())))
            .finish()
    }
}

/// Resolves the agent set for the configured targeting mode.
pub struct AgentResolver {
    mode: RegisterMode,
    static_address: String,
    node_selector: String,
    pod_selector: String,
    connector: Arc<dyn AgentConnector>,
}

impl AgentResolver {
    pub fn new(config: &Config, connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            mode: config.register_mode,
            static_address: config.consul.address.clone(),
            node_selector: config.node_selector.clone(),
            pod_selector: config.pod_selector.clone(),
            connector,
        }
    }

    pub fn mode(&self) -> RegisterMode {
        self.mode
    }

    /// Resolve a fresh agent set. List failures propagate untouched so
    /// the caller can abort its pass.
    pub async fn resolve(&self, cluster: &dyn Cluster) -> Result<AgentSet> {
        let mut set = AgentSet::default();

        match self.mode {
            RegisterMode::Single => {
                let key = self.static_address.clone();
                set.insert(key.clone(), self.connector.connect(&self.static_address));
                set.catch_all = Some(key);
            }
            RegisterMode::Node => {
                for node in cluster.list_nodes(Some(&self.node_selector)).await? {
                    let host = node_host_ip(&node);
                    set.insert(node.name.clone(), self.connector.connect(&host));
                    set.index(host, &node.name);
                    for address in &node.addresses {
                        set.index(address.address.clone(), &node.name);
                    }
                }
            }
            RegisterMode::Pod => {
                let hosts = cluster.list_pod_hosts(&self.pod_selector).await?;
                let nodes = if hosts.is_empty() {
                    Vec::new()
                } else {
                    cluster.list_nodes(None).await?
                };
                for host in hosts {
                    set.insert(host.clone(), self.connector.connect(&host));
                    set.index(host.clone(), &host);
                    // the pod's agent also serves every other address of its node
                    let owner = nodes.iter().find(|node| {
                        node_host_ip(node) == host || node.addresses.iter().any(|a| a.address == host)
                    });
                    for address in owner.iter().flat_map(|node| &node.addresses) {
                        set.index(address.address.clone(), &host);
                    }
                }
            }
        }

        debug!("Agents: {:?}", set);
        Ok(set)
    }
}

/// Address of the agent running on `node`: the node name when it is an IP
/// literal, else its first internal IP, else the name itself.
pub fn node_host_ip(node: &Node) -> String {
    if node.name.parse::<IpAddr>().is_ok() {
        return node.name.clone();
    }
    node.addresses
        .iter()
        .find(|a| a.kind == AddressType::InternalIp)
        .map(|a| a.address.clone())
        .unwrap_or_else(|| node.name.clone())
}
