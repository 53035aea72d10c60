//! Error types for outpost

use thiserror::Error;

use crate::drain::DrainError;
use crate::ingress::IngressError;
use crate::known_hosts::KnownHostsError;
use crate::pki::SigningError;
use crate::topology::TopologyError;

/// Main error type for outpost operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required configuration or secret value is missing or invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Group ranges or node identities could not be assigned
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Host certificate issuance failed; the node must not be provisioned
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),

    /// Tunnel drain aborted
    #[error("drain error: {0}")]
    Drain(#[from] DrainError),

    /// Ingress rules violate ordering or uniqueness
    #[error("ingress error: {0}")]
    Ingress(#[from] IngressError),

    /// Known-hosts trust material is inconsistent
    #[error("known hosts error: {0}")]
    KnownHosts(#[from] KnownHostsError),

    /// Template rendering error
    #[error("template error: {0}")]
    Template(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error aborts provisioning before any resource is touched
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Topology(_))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<minijinja::Error> for Error {
    fn from(e: minijinja::Error) -> Self {
        Self::Template(e.to_string())
    }
}
