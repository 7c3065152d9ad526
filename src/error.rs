//! Error types for the KubePortal daemon

use thiserror::Error;

/// Main error type for daemon operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A forward definition failed validation and was rejected
    #[error("validation error: {0}")]
    Validation(String),

    /// A forward or group lookup missed
    #[error("{0} not found")]
    NotFound(String),

    /// The local port is already bound by another process or forward
    #[error("port {0} is already in use")]
    AddressInUse(u16),

    /// A bind failure other than an address conflict
    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        /// The local port the listener tried to bind
        port: u16,
        /// The underlying bind error
        #[source]
        source: std::io::Error,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubernetes-path failure outside the API client (pod resolution,
    /// port-forward channel setup, kubeconfig loading)
    #[error("kubernetes error: {0}")]
    Kubernetes(String),

    /// The remote endpoint of a socket forward could not be reached
    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// Config file could not be read, parsed, or written
    #[error("config error: {0}")]
    ConfigIo(String),

    /// Unexpected internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error; `what` names the missing entity
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a kubernetes-path error with the given message
    pub fn kubernetes(msg: impl Into<String>) -> Self {
        Self::Kubernetes(msg.into())
    }

    /// Create a config I/O error with the given message
    pub fn config_io(msg: impl Into<String>) -> Self {
        Self::ConfigIo(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for failures that should disable the definition when they occur
    /// at startup, so the operator sees the conflict in persisted state.
    pub fn disables_definition(&self) -> bool {
        matches!(self, Self::AddressInUse(_))
    }
}
