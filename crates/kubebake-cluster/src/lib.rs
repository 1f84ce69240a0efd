//! Cluster access for kubebake.
//!
//! The [`ClusterClient`] trait is the seam between the build pipeline and the
//! cluster. Two implementations are provided:
//!
//! - [`KubeClient`] talks to a real API server over HTTPS
//! - [`MemoryCluster`] keeps everything in memory and is scriptable from tests
//!
//! Resource bodies live in [`types`] and serialize to the shapes the CDI and
//! KubeVirt APIs accept.

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod http;
pub mod kubeconfig;
pub mod memory;
pub mod types;

pub use client::{ClusterClient, PortIo, PortStream, WatchStream};
pub use error::{ClusterError, Result};
pub use http::KubeClient;
pub use kubeconfig::{ClientIdentity, ClusterConnection};
pub use memory::{ClusterCall, MemoryCluster, PortAttempt, WatchScript};
pub use types::{
    DataVolumePhase, DataVolumeSpec, InstancePhase, InstanceSpec, Quantity, QuantityError,
    ResourceKind, ResourceName, ResourcePhase, SecretSpec,
};
