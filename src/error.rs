//! Error types for cluster lifecycle operations

use thiserror::Error;

use crate::provider::ProviderError;

/// Main error type for eks-harness operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration document failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Cloud provider call failed
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// HTTP request failed
    #[error("http error: {0}")]
    Http(String),

    /// External command failed
    #[error("command failed: {0}")]
    Command(String),

    /// Operator interrupt or stop signal
    #[error("aborted: {0}")]
    Aborted(String),

    /// A deadline expired before the operation finished
    #[error("timed out: {0}")]
    Timeout(String),

    /// Declarative template stack failure
    #[error("stack error: {0}")]
    Stack(String),

    /// Control plane failure
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Worker pool failure
    #[error("node group error: {0}")]
    NodeGroup(String),

    /// Add-on lifecycle failure
    #[error("add-on {name} failed: {message}")]
    AddOn {
        /// Add-on name
        name: String,
        /// Failure description
        message: String,
    },

    /// Cluster health check failure
    #[error("health check failed: {0}")]
    Health(String),

    /// One or more teardown steps failed
    #[error("teardown failed: {}", .0.join(", "))]
    Teardown(Vec<String>),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an HTTP error with the given message
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a command error with the given message
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create an aborted error with the given reason
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a stack error with the given message
    pub fn stack(msg: impl Into<String>) -> Self {
        Self::Stack(msg.into())
    }

    /// Create a cluster error with the given message
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a node group error with the given message
    pub fn node_group(msg: impl Into<String>) -> Self {
        Self::NodeGroup(msg.into())
    }

    /// Create an add-on error
    pub fn add_on(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AddOn {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a health check error with the given message
    pub fn health(msg: impl Into<String>) -> Self {
        Self::Health(msg.into())
    }

    /// True when the error came from an operator interrupt rather than a failure
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<minijinja::Error> for Error {
    fn from(e: minijinja::Error) -> Self {
        Error::Serialization(format!("template: {e}"))
    }
}
