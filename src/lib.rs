//! Registers annotated Kubernetes services in Consul.
//!
//! The controller watches nodes and services, builds one Consul entry per
//! reachable (address, port) of every enabled service, and periodically
//! re-syncs and cleans the registry.  Every entry is stamped with an
//! ownership tag and the owning service's `uid:` tag, which is all that is
//! needed to rebuild the controller's view after a restart.

pub mod agents;
pub mod cluster;
pub mod config;
pub mod consul;
pub mod controller;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
