//! Kubernetes-backed [`Cluster`] using `kube` list and watch APIs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Node as KubeNode, Pod, Service};
use kube::api::ListParams;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::{Cluster, NodeEvent, ServiceEvent};
use crate::error::Result;
use crate::types::{AddressType, Node, NodeAddress, Routing, Workload, WorkloadPort};

pub struct KubeCluster {
    client: Client,
    namespace: Option<String>,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn services(&self) -> Api<Service> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn list_services(&self) -> Result<Vec<Workload>> {
        let services = self.services().list(&ListParams::default()).await?;
        Ok(services.items.iter().map(workload_from_service).collect())
    }

    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<Node>> {
        let api: Api<KubeNode> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            params = params.labels(selector);
        }
        let nodes = api.list(&params).await?;
        Ok(nodes.items.iter().map(node_from_kube).collect())
    }

    async fn list_pod_hosts(&self, selector: &str) -> Result<Vec<String>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| pod.status.and_then(|s| s.host_ip))
            .filter(|ip| !ip.is_empty())
            .collect())
    }

    async fn watch_nodes(&self, events: mpsc::Sender<NodeEvent>) -> Result<()> {
        let api: Api<KubeNode> = Api::all(self.client.clone());
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        let mut membership = NodeMembership::default();

        info!("Starting node watcher");
        while let Some(event) = stream.next().await {
            let out: Vec<NodeEvent> = match event {
                Ok(watcher::Event::Init) => {
                    membership.relist();
                    Vec::new()
                }
                Ok(watcher::Event::InitApply(obj)) | Ok(watcher::Event::Apply(obj)) => {
                    membership.applied(node_from_kube(&obj)).into_iter().collect()
                }
                Ok(watcher::Event::InitDone) => membership.relist_done(),
                Ok(watcher::Event::Delete(obj)) => vec![membership.deleted(node_from_kube(&obj))],
                Err(e) => {
                    warn!("Node watch error: {}", e);
                    Vec::new()
                }
            };

            for event in out {
                if events.send(event).await.is_err() {
                    debug!("Node event channel closed, stopping node watcher");
                    return Ok(());
                }
            }
        }

        warn!("Node watch stream ended");
        Ok(())
    }

    async fn watch_services(&self, events: mpsc::Sender<ServiceEvent>) -> Result<()> {
        let mut stream = watcher(self.services(), watcher::Config::default())
            .default_backoff()
            .boxed();

        info!(
            "Starting service watcher in {}",
            self.namespace.as_deref().unwrap_or("all namespaces")
        );
        while let Some(event) = stream.next().await {
            let out = match event {
                Ok(watcher::Event::InitApply(obj)) | Ok(watcher::Event::Apply(obj)) => {
                    ServiceEvent::Applied(workload_from_service(&obj))
                }
                Ok(watcher::Event::Delete(obj)) => ServiceEvent::Deleted(workload_from_service(&obj)),
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => continue,
                Err(e) => {
                    warn!("Service watch error: {}", e);
                    continue;
                }
            };

            if events.send(out).await.is_err() {
                debug!("Service event channel closed, stopping service watcher");
                return Ok(());
            }
        }

        warn!("Service watch stream ended");
        Ok(())
    }
}

/// Tracks node names seen by one watch so that status updates of known
/// nodes are not reported as joins, and nodes that vanished while the
/// watch was re-listing are still reported as removed.
#[derive(Debug, Default)]
struct NodeMembership {
    known: HashMap<String, Node>,
    relisted: HashSet<String>,
}

impl NodeMembership {
    fn relist(&mut self) {
        self.relisted.clear();
    }

    fn applied(&mut self, node: Node) -> Option<NodeEvent> {
        self.relisted.insert(node.name.clone());
        match self.known.insert(node.name.clone(), node.clone()) {
            Some(_) => None,
            None => Some(NodeEvent::Added(node)),
        }
    }

    fn deleted(&mut self, node: Node) -> NodeEvent {
        self.known.remove(&node.name);
        self.relisted.remove(&node.name);
        NodeEvent::Removed(node)
    }

    fn relist_done(&mut self) -> Vec<NodeEvent> {
        let gone: Vec<String> = self
            .known
            .keys()
            .filter(|name| !self.relisted.contains(*name))
            .cloned()
            .collect();
        gone.into_iter()
            .filter_map(|name| self.known.remove(&name))
            .map(NodeEvent::Removed)
            .collect()
    }
}

pub fn workload_from_service(service: &Service) -> Workload {
    let meta = &service.metadata;
    let spec = service.spec.as_ref();

    let ports: Vec<WorkloadPort> = spec
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| WorkloadPort {
                    protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    port: p.port,
                    node_port: p.node_port,
                })
                .collect()
        })
        .unwrap_or_default();

    Workload {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        routing: Routing::from_service_type(spec.and_then(|s| s.type_.as_deref())),
        ports,
        external_ips: spec
            .and_then(|s| s.external_ips.clone())
            .unwrap_or_default(),
    }
}

pub fn node_from_kube(node: &KubeNode) -> Node {
    let addresses: Vec<NodeAddress> = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addrs| {
            addrs
                .iter()
                .map(|a| NodeAddress {
                    kind: AddressType::parse(&a.type_),
                    address: a.address.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    Node {
        name: node.metadata.name.clone().unwrap_or_default(),
        addresses,
    }
}
