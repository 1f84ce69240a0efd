//! Error types for cluster operations.

use thiserror::Error;

use crate::types::ResourceKind;

/// Errors returned by a [`ClusterClient`](crate::ClusterClient).
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    #[error("API server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("watch stream error: {0}")]
    Watch(String),

    #[error("port stream to {namespace}/{name}:{port} failed: {message}")]
    PortStream {
        namespace: String,
        name: String,
        port: u16,
        message: String,
    },

    #[error("kubeconfig error: {0}")]
    KubeConfig(String),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure injected by [`MemoryCluster`](crate::MemoryCluster).
    #[error("injected failure: {0}")]
    Injected(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Returns true if the error means the resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Api { status, .. } => *status == 404,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
