//! Error types for the build pipeline.

use kubebake_cluster::{ClusterError, QuantityError};
use thiserror::Error;

/// Errors that can halt a build.
#[derive(Debug, Error)]
pub enum BuildError {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The configuration could not be loaded or failed validation.
    ///
    /// Validation collects every problem before failing.
    #[error("invalid configuration: {}", problems.join("; "))]
    Config {
        /// One entry per problem found.
        problems: Vec<String>,
    },

    /// A resource quantity string is malformed.
    #[error("invalid quantity for {field}: {source}")]
    InvalidQuantity {
        field: String,
        #[source]
        source: QuantityError,
    },

    /// A data volume source type is not one of `http`, `registry` or `blank`.
    #[error("unknown data volume source type {0:?}")]
    UnknownSourceType(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Shell errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The handshake was rejected for authentication more times than allowed.
    #[error("ssh handshake failed after {attempts} attempts: {message}")]
    HandshakeExhausted {
        attempts: u32,
        /// Last authentication error.
        message: String,
    },

    /// The handshake failed for a reason retrying cannot fix.
    #[error("ssh handshake failed: {0}")]
    Handshake(String),

    /// No shell session was established within the overall timeout.
    #[error("timed out waiting for ssh after {0:?}")]
    ShellTimeout(std::time::Duration),

    /// A provisioning command exited non-zero or could not be run.
    #[error("provisioning command {command:?} failed: {message}")]
    Provision { command: String, message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Resource lifecycle errors
    // ─────────────────────────────────────────────────────────────────────────
    /// A data volume reported `Failed`.
    #[error("data volume {name} failed")]
    DataVolumeFailed { name: String },

    /// A data volume reported a phase outside the recognized set.
    #[error("unexpected data volume phase {phase:?} for {name}")]
    UnexpectedDataVolumePhase { name: String, phase: String },

    /// An instance reported a phase other than `Running` or `Succeeded`.
    #[error("unexpected virtual machine instance phase {phase:?} for {name}")]
    UnexpectedInstancePhase { name: String, phase: String },

    /// A watch stream ended before a terminal phase was seen.
    #[error("watch on {name} closed before reaching a terminal phase")]
    WatchClosed { name: String },

    /// A fixed-name data volume already exists and `force` is not set.
    #[error("data volume {namespace}/{name} already exists (use force to replace it)")]
    VolumeExists { namespace: String, name: String },

    /// A cluster request failed.
    #[error("failed to {action}: {source}")]
    Cluster {
        /// What was being attempted, e.g. "create data volume".
        action: String,
        #[source]
        source: ClusterError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Artifact errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Deleting artifact volumes failed for one or more volumes.
    #[error("failed to destroy artifact: {}", failures.join("; "))]
    Destroy { failures: Vec<String> },

    /// The named volume is not part of the artifact.
    #[error("data volume {namespace}/{name} is not part of the artifact")]
    UnknownVolume { namespace: String, name: String },

    /// The artifact manifest could not be encoded or decoded.
    #[error("invalid artifact manifest: {0}")]
    Manifest(String),

    /// Reading or writing a local file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ─────────────────────────────────────────────────────────────────────────
    // Pipeline errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The build was cancelled from outside.
    #[error("build cancelled")]
    Cancelled,

    /// A step tried to record an output that was already recorded.
    #[error("output {0} already recorded")]
    SlotAlreadyRecorded(String),

    /// A step needed an output that no earlier step recorded.
    #[error("output {0} has not been recorded")]
    MissingOutput(String),
}

impl BuildError {
    /// Create a configuration error with a single problem.
    #[must_use]
    pub fn config(problem: impl Into<String>) -> Self {
        Self::Config {
            problems: vec![problem.into()],
        }
    }

    /// Wrap a cluster error with the action that produced it.
    #[must_use]
    pub fn cluster(action: impl Into<String>, source: ClusterError) -> Self {
        Self::Cluster {
            action: action.into(),
            source,
        }
    }

    /// Returns true for external cancellation as opposed to failure.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true for errors raised before any resource was created.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::InvalidQuantity { .. } | Self::UnknownSourceType(_)
        )
    }
}

/// Result type for build operations.
pub type BuildResult<T> = Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_lists_every_problem() {
        let err = BuildError::Config {
            problems: vec!["ssh.username is required".into(), "no disks".into()],
        };
        assert_eq!(
            err.to_string(),
            "invalid configuration: ssh.username is required; no disks"
        );
        assert!(err.is_configuration());
        assert!(!err.is_cancellation());
    }

    #[test]
    fn cancellation_is_distinct() {
        assert!(BuildError::Cancelled.is_cancellation());
        assert!(!BuildError::DataVolumeFailed { name: "dv".into() }.is_cancellation());
    }
}
