use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{RegisteredService, RegistryEntry};

pub mod http;
pub use http::{HttpAgent, HttpConnector};

/// A single registry agent endpoint.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Address used for logging and metric labels.
    fn address(&self) -> &str;

    /// Register or overwrite an entry. Registering the same identity twice
    /// replaces the previous registration.
    async fn register(&self, entry: &RegistryEntry) -> Result<()>;

    /// Remove the entry with the given identity.
    async fn deregister(&self, id: &str) -> Result<()>;

    /// All services currently registered with this agent.
    async fn services(&self) -> Result<Vec<RegisteredService>>;
}

/// Builds agent clients for a host.
pub trait AgentConnector: Send + Sync {
    fn connect(&self, host: &str) -> Arc<dyn Agent>;
}
