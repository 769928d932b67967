//! Error types for the register daemon.

use thiserror::Error;

/// Main error type for reconciliation operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Transport-level failure talking to a Consul agent
    #[error("consul request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Consul agent answered with a non-success status
    #[error("consul agent {address} returned {status}: {body}")]
    Consul {
        address: String,
        status: u16,
        body: String,
    },

    /// An annotation value could not be interpreted
    #[error("can't convert value of {annotation} annotation ({value:?}): {reason}")]
    Annotation {
        annotation: &'static str,
        value: String,
        reason: String,
    },

    /// The agent set for this pass could not be resolved
    #[error("can't cache consul agents: {0}")]
    AgentCache(Box<Error>),

    /// No cached agent serves the target address
    #[error("no consul agent serves address {0}")]
    NoAgent(String),

    /// The configured resource source has no implementation
    #[error("unsupported register source: {0}")]
    UnsupportedSource(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an annotation error for the given key and raw value
    pub fn annotation(
        annotation: &'static str,
        value: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Annotation {
            annotation,
            value: value.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
