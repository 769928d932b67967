use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{Node, Workload};

pub mod k8s;
pub use k8s::KubeCluster;

/// A node membership change.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A node joined the cluster (or was first seen by this watch).
    Added(Node),
    /// A node left the cluster.
    Removed(Node),
}

/// A service change.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// The service was created or updated.
    Applied(Workload),
    /// The service was deleted.
    Deleted(Workload),
}

/// Read access to the orchestration system.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// All services in the watched namespace.
    async fn list_services(&self) -> Result<Vec<Workload>>;

    /// Nodes, optionally filtered by a label selector.
    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<Node>>;

    /// Host IPs of scheduled pods matching the selector, in any namespace.
    async fn list_pod_hosts(&self, selector: &str) -> Result<Vec<String>>;

    /// Stream node changes until the receiver is dropped.
    /// Updates should be sent to the provided channel.
    async fn watch_nodes(&self, events: mpsc::Sender<NodeEvent>) -> Result<()>;

    /// Stream service changes until the receiver is dropped.
    async fn watch_services(&self, events: mpsc::Sender<ServiceEvent>) -> Result<()>;
}
