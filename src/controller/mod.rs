use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::cluster::Cluster;
use crate::config::{Config, RegisterSource};
use crate::consul::AgentConnector;
use crate::error::{Error, Result};

pub mod services;
pub mod watch;

pub use services::ServiceController;

/// A reconciler driven by one kind of cluster resource.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Register everything that should be in the registry but is not.
    async fn sync(&self) -> Result<()>;

    /// Remove registry entries whose owning resource is gone.
    async fn clean(&self) -> Result<()>;

    /// Start the long-lived watch tasks.
    fn watch(self: Arc<Self>) -> Vec<JoinHandle<()>>;
}

/// Build the controller for the configured resource source.
pub fn new(
    config: &Config,
    cluster: Arc<dyn Cluster>,
    connector: Arc<dyn AgentConnector>,
) -> Result<Arc<dyn Controller>> {
    match config.register_source {
        RegisterSource::Service => Ok(Arc::new(ServiceController::new(config, cluster, connector))),
        RegisterSource::Endpoint => Err(Error::UnsupportedSource("endpoint".into())),
        RegisterSource::Pod => Err(Error::UnsupportedSource("pod".into())),
    }
}
