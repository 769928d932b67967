//! Watch loops feeding cluster events into the service controller.
//!
//! Each resource kind gets a producer task (the cluster watch, pushing
//! typed events into a channel) and a consumer task that hands every
//! event to the controller.  Handler errors are logged and the loops keep
//! running; they end only when the producer side goes away.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ServiceController;
use crate::cluster::{Cluster, NodeEvent, ServiceEvent};

const NODE_EVENT_BUFFER: usize = 64;
const SERVICE_EVENT_BUFFER: usize = 256;

/// Spawn node and service watch tasks.
pub fn spawn(controller: Arc<ServiceController>, cluster: Arc<dyn Cluster>) -> Vec<JoinHandle<()>> {
    let (node_tx, node_rx) = mpsc::channel(NODE_EVENT_BUFFER);
    let (service_tx, service_rx) = mpsc::channel(SERVICE_EVENT_BUFFER);

    let node_cluster = Arc::clone(&cluster);
    let node_watch = tokio::spawn(async move {
        if let Err(e) = node_cluster.watch_nodes(node_tx).await {
            error!("Node watcher failed: {}", e);
        }
    });

    let service_watch = tokio::spawn(async move {
        if let Err(e) = cluster.watch_services(service_tx).await {
            error!("Service watcher failed: {}", e);
        }
    });

    vec![
        node_watch,
        tokio::spawn(handle_node_events(Arc::clone(&controller), node_rx)),
        service_watch,
        tokio::spawn(handle_service_events(controller, service_rx)),
    ]
}

/// Run a full sync per batch of node joins and a cleanup per removal.
///
/// Joins that are already queued behind the first one are folded into the
/// same sync; a removal ends the batch and is handled right after it.
pub async fn handle_node_events(
    controller: Arc<ServiceController>,
    mut events: mpsc::Receiver<NodeEvent>,
) {
    let mut pending = None;
    loop {
        let event = match pending.take() {
            Some(event) => event,
            None => match events.recv().await {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            NodeEvent::Added(node) => {
                info!("Add node {}", node.name);
                while let Ok(next) = events.try_recv() {
                    match next {
                        NodeEvent::Added(node) => info!("Add node {}", node.name),
                        removed => {
                            pending = Some(removed);
                            break;
                        }
                    }
                }
                if let Err(e) = controller.sync().await {
                    error!("Failed to add node: {}", e);
                }
            }
            NodeEvent::Removed(node) => {
                info!("Delete node {}", node.name);
                if let Err(e) = controller.node_removed(&node).await {
                    error!("Failed to delete node {}: {}", node.name, e);
                }
            }
        }
    }
    warn!("Node event channel closed");
}

pub async fn handle_service_events(
    controller: Arc<ServiceController>,
    mut events: mpsc::Receiver<ServiceEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ServiceEvent::Applied(workload) => {
                if let Err(e) = controller.service_applied(&workload).await {
                    error!(
                        "Failed to update service {}/{}: {}",
                        workload.namespace, workload.name, e
                    );
                }
            }
            ServiceEvent::Deleted(workload) => {
                if let Err(e) = controller.service_deleted(&workload).await {
                    error!(
                        "Failed to delete service {}/{}: {}",
                        workload.namespace, workload.name, e
                    );
                }
            }
        }
    }
    warn!("Service event channel closed");
}
