//! Service-driven reconciliation.
//!
//! All mutating entry points (`sync`, `clean`, node removal and the
//! single-service paths) take the same async mutex for their whole
//! duration, so registry writes and the in-memory bookkeeping are only
//! ever touched by one pass at a time.  The dedup set of registered
//! identities is a cache: `sync` rebuilds it from what the agents report,
//! filtered by the ownership tag, which is the only state that survives a
//! restart.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{watch, Controller};
use crate::agents::{AgentResolver, AgentSet};
use crate::cluster::Cluster;
use crate::config::Config;
use crate::consul::AgentConnector;
use crate::entry::{entry_id, is_register_enabled, EntryBuilder};
use crate::error::{Error, Result};
use crate::metrics::{self, FuncTimer};
use crate::types::{Node, RegisteredService, Routing, Workload};

/// Owned entries as reported by the agents of one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// entry identity -> key of the agent holding it
    pub by_id: BTreeMap<String, String>,
    /// workload uid -> entry identities
    pub by_uid: BTreeMap<String, Vec<String>>,
}

impl Snapshot {
    /// Record `service` listed by `agent_key` if it carries the ownership tag.
    ///
    /// Owned entries without a `uid:` tag are kept under the empty uid; no
    /// workload has that uid, so `clean` removes them.
    pub fn record(&mut self, owner_tag: &str, agent_key: &str, service: RegisteredService) {
        if !service.has_tag(owner_tag) {
            return;
        }
        let uid = service.tag_value("uid").unwrap_or_default().to_string();
        self.by_uid.entry(uid).or_default().push(service.id.clone());
        self.by_id.insert(service.id, agent_key.to_string());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }
}

#[derive(Default)]
struct State {
    registered: HashSet<String>,
    agents: AgentSet,
}

impl State {
    fn holds_entries_of(&self, workload: &Workload) -> bool {
        let prefix = format!("{}-{}-", workload.name, workload.uid);
        self.registered.iter().any(|id| id.starts_with(&prefix))
    }
}

/// Reconciles Kubernetes services into Consul.
pub struct ServiceController {
    cluster: Arc<dyn Cluster>,
    resolver: AgentResolver,
    builder: EntryBuilder,
    /// Selector for nodes whose addresses NodePort services are registered on.
    node_selector: Option<String>,
    state: Mutex<State>,
}

impl ServiceController {
    pub fn new(
        config: &Config,
        cluster: Arc<dyn Cluster>,
        connector: Arc<dyn AgentConnector>,
    ) -> Self {
        Self {
            cluster,
            resolver: AgentResolver::new(config, connector),
            builder: EntryBuilder::new(config.k8s_tag.clone()),
            node_selector: config.target_node_selector().map(String::from),
            state: Mutex::new(State::default()),
        }
    }

    /// Register every eligible service that has entries missing from
    /// the registry.
    pub async fn sync(&self) -> Result<()> {
        let _timer = FuncTimer::start("sync");
        let mut state = self.state.lock().await;

        self.refresh_agents(&mut state).await?;
        let snapshot = self.snapshot(&state.agents).await;
        debug!("Added services: {:?}", snapshot.by_id);
        state.registered = snapshot.by_id.keys().cloned().collect();

        let workloads = self.eligible_workloads().await?;
        let nodes = if workloads.iter().any(needs_node_addresses) {
            self.node_addresses().await?
        } else {
            Vec::new()
        };

        for workload in &workloads {
            let missing = match snapshot.by_uid.get(&workload.uid) {
                None => true,
                Some(_) => targets(workload, &nodes)
                    .iter()
                    .any(|(address, port)| !snapshot.contains(&entry_id(workload, address, *port))),
            };
            if missing {
                self.register_targets(&mut state, workload, &nodes).await;
            }
        }
        Ok(())
    }

    /// Deregister entries whose owning service no longer exists or is no
    /// longer enabled.
    pub async fn clean(&self) -> Result<()> {
        let _timer = FuncTimer::start("clean");
        let mut state = self.state.lock().await;

        self.refresh_agents(&mut state).await?;
        let snapshot = self.snapshot(&state.agents).await;
        debug!("Added services: {:?}", snapshot.by_id);

        let current: HashSet<String> = self
            .eligible_workloads()
            .await?
            .into_iter()
            .map(|w| w.uid)
            .collect();

        for (uid, ids) in &snapshot.by_uid {
            if current.contains(uid) {
                continue;
            }
            for id in ids {
                if let Some(key) = snapshot.by_id.get(id) {
                    self.deregister_on(&mut state, key, id).await;
                }
            }
        }
        Ok(())
    }

    /// Deregister every entry targeting an address of a removed node.
    pub async fn node_removed(&self, node: &Node) -> Result<()> {
        let _timer = FuncTimer::start("node_delete");
        let mut state = self.state.lock().await;
        state.registered.clear();

        self.refresh_agents(&mut state).await?;
        let snapshot = self.snapshot(&state.agents).await;
        state.registered = snapshot.by_id.keys().cloned().collect();

        let needles: Vec<String> = node
            .addresses
            .iter()
            .map(|a| format!("-{}-", a.address))
            .collect();

        for (id, key) in &snapshot.by_id {
            if needles.iter().any(|needle| id.contains(needle)) {
                self.deregister_on(&mut state, key, id).await;
            }
        }
        Ok(())
    }

    /// Handle a created or updated service.
    pub async fn service_applied(&self, workload: &Workload) -> Result<()> {
        let _timer = FuncTimer::start("update");
        let enabled = is_register_enabled(workload);
        let mut state = self.state.lock().await;
        if !enabled && !state.holds_entries_of(workload) {
            return Ok(());
        }

        self.refresh_agents(&mut state).await?;
        let nodes = self.node_addresses_for(workload).await?;
        if enabled {
            self.register_targets(&mut state, workload, &nodes).await;
        } else {
            self.deregister_targets(&mut state, workload, &nodes).await;
        }
        Ok(())
    }

    /// Handle a deleted service.
    pub async fn service_deleted(&self, workload: &Workload) -> Result<()> {
        let _timer = FuncTimer::start("delete");
        if !is_register_enabled(workload) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if !state.holds_entries_of(workload) {
            return Ok(());
        }

        self.refresh_agents(&mut state).await?;
        let nodes = self.node_addresses_for(workload).await?;
        self.deregister_targets(&mut state, workload, &nodes).await;
        Ok(())
    }

    /// Owned entries currently reported by the agents.
    pub async fn registered(&self) -> Result<Snapshot> {
        let mut state = self.state.lock().await;
        self.refresh_agents(&mut state).await?;
        Ok(self.snapshot(&state.agents).await)
    }

    async fn refresh_agents(&self, state: &mut State) -> Result<()> {
        state.agents = self
            .resolver
            .resolve(self.cluster.as_ref())
            .await
            .map_err(|e| Error::AgentCache(Box::new(e)))?;
        Ok(())
    }

    async fn snapshot(&self, agents: &AgentSet) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for (key, agent) in agents.iter() {
            match agent.services().await {
                Ok(services) => {
                    metrics::consul_success("services", agent.address());
                    for service in services {
                        snapshot.record(self.builder.owner_tag(), key, service);
                    }
                }
                Err(e) => {
                    error!(
                        "Can't get services from Consul agent {}, register mode={:?}: {}",
                        key,
                        self.resolver.mode(),
                        e
                    );
                    metrics::consul_failure("services", agent.address());
                }
            }
        }
        snapshot
    }

    async fn eligible_workloads(&self) -> Result<Vec<Workload>> {
        Ok(self
            .cluster
            .list_services()
            .await?
            .into_iter()
            .filter(is_register_enabled)
            .collect())
    }

    async fn node_addresses(&self) -> Result<Vec<String>> {
        let nodes = self.cluster.list_nodes(self.node_selector.as_deref()).await?;
        Ok(nodes
            .iter()
            .flat_map(|n| n.routable_addresses().map(String::from))
            .collect())
    }

    async fn node_addresses_for(&self, workload: &Workload) -> Result<Vec<String>> {
        if needs_node_addresses(workload) {
            self.node_addresses().await
        } else {
            Ok(Vec::new())
        }
    }

    async fn register_targets(&self, state: &mut State, workload: &Workload, nodes: &[String]) {
        for (address, port) in targets(workload, nodes) {
            let entry = match self.builder.build(workload, &address, port) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(
                        "Cannot create Consul service for {}/{}: {}",
                        workload.namespace, workload.name, e
                    );
                    return;
                }
            };

            if state.registered.contains(&entry.id) {
                debug!("Service {} has already registered in Consul", entry.id);
                continue;
            }

            let Some(agent) = state.agents.for_address(&address).cloned() else {
                error!("Cannot register service in Consul: {}", Error::NoAgent(address.clone()));
                metrics::consul_unresolved("register");
                continue;
            };

            match agent.register(&entry).await {
                Ok(()) => {
                    info!(
                        "Service {} has been registered in Consul with ID: {}",
                        workload.name, entry.id
                    );
                    metrics::consul_success("register", agent.address());
                    state.registered.insert(entry.id);
                }
                Err(e) => {
                    error!("Cannot register service in Consul: {}", e);
                    metrics::consul_failure("register", agent.address());
                }
            }
        }
    }

    async fn deregister_targets(&self, state: &mut State, workload: &Workload, nodes: &[String]) {
        for (address, port) in targets(workload, nodes) {
            let id = entry_id(workload, &address, port);
            if !state.registered.contains(&id) {
                debug!("Service {} has already been deleted in Consul", id);
                continue;
            }

            let Some(agent) = state.agents.for_address(&address).cloned() else {
                error!("Cannot deregister service in Consul: {}", Error::NoAgent(address.clone()));
                metrics::consul_unresolved("deregister");
                continue;
            };

            match agent.deregister(&id).await {
                Ok(()) => {
                    info!(
                        "Service {} has been deregistered in Consul with ID: {}",
                        workload.name, id
                    );
                    metrics::consul_success("deregister", agent.address());
                    state.registered.remove(&id);
                }
                Err(e) => {
                    error!("Cannot deregister service in Consul: {}", e);
                    metrics::consul_failure("deregister", agent.address());
                }
            }
        }
    }

    /// Deregister `id` on the agent that listed it.
    async fn deregister_on(&self, state: &mut State, agent_key: &str, id: &str) {
        let Some(agent) = state.agents.get(agent_key).cloned() else {
            warn!("Agent {} disappeared before {} could be deregistered", agent_key, id);
            return;
        };

        match agent.deregister(id).await {
            Ok(()) => {
                info!("Service has been deregistered in Consul with ID: {}", id);
                metrics::consul_success("deregister", agent.address());
                state.registered.remove(id);
            }
            Err(e) => {
                error!("Cannot deregister service in Consul: {}", e);
                metrics::consul_failure("deregister", agent.address());
            }
        }
    }
}

#[async_trait]
impl Controller for ServiceController {
    async fn sync(&self) -> Result<()> {
        ServiceController::sync(self).await
    }

    async fn clean(&self) -> Result<()> {
        ServiceController::clean(self).await
    }

    fn watch(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let cluster = Arc::clone(&self.cluster);
        watch::spawn(self, cluster)
    }
}

fn needs_node_addresses(workload: &Workload) -> bool {
    workload.routing == Routing::NodePort && workload.external_ips.is_empty()
}

/// (address, port) pairs a workload should be registered at.
///
/// NodePort services use their external IPs when set, else every node
/// address, with each TCP node port.  ClusterIP services are registered
/// only on their external IPs, with each TCP service port.
pub fn targets(workload: &Workload, node_addresses: &[String]) -> Vec<(String, i32)> {
    let tcp = workload.ports.iter().filter(|p| p.is_tcp());
    let (addresses, ports): (&[String], Vec<i32>) = match workload.routing {
        Routing::NodePort => {
            let addresses = if workload.external_ips.is_empty() {
                node_addresses
            } else {
                workload.external_ips.as_slice()
            };
            (addresses, tcp.filter_map(|p| p.node_port).collect())
        }
        Routing::ExternalIps => (
            workload.external_ips.as_slice(),
            tcp.map(|p| p.port).collect(),
        ),
        Routing::Other => return Vec::new(),
    };

    addresses
        .iter()
        .flat_map(|address| ports.iter().map(move |port| (address.clone(), *port)))
        .collect()
}
