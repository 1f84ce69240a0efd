//! The cluster client boundary.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::types::{
    DataVolumePhase, DataVolumeSpec, InstancePhase, InstanceSpec, ResourceName, SecretSpec,
};

/// Stream of status phases observed for a single resource.
///
/// The stream never terminates on its own while the resource exists; callers
/// stop reading when they see a terminal phase or are cancelled.
pub type WatchStream<P> = BoxStream<'static, Result<P>>;

/// Bidirectional byte stream to a port inside a running instance.
pub trait PortIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> PortIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Owned port stream.
pub type PortStream = Box<dyn PortIo>;

/// Operations a build needs from the cluster.
///
/// Every `create_*` call returns the final resource name, which differs from
/// the request when the name was [`ResourceName::Generated`].
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create a data volume.
    async fn create_data_volume(
        &self,
        namespace: &str,
        name: &ResourceName,
        spec: &DataVolumeSpec,
    ) -> Result<String>;

    /// Look up a data volume's phase. Returns `None` if it does not exist.
    async fn get_data_volume(&self, namespace: &str, name: &str)
        -> Result<Option<DataVolumePhase>>;

    /// Delete a data volume.
    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()>;

    /// Watch a single data volume for phase changes.
    async fn watch_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WatchStream<DataVolumePhase>>;

    /// Create a secret holding literal string data.
    async fn create_secret(
        &self,
        namespace: &str,
        name: &ResourceName,
        spec: &SecretSpec,
    ) -> Result<String>;

    /// Delete a secret.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a virtual machine instance.
    async fn create_instance(
        &self,
        namespace: &str,
        name: &ResourceName,
        spec: &InstanceSpec,
    ) -> Result<String>;

    /// Look up an instance's phase. Returns `None` if it does not exist.
    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<InstancePhase>>;

    /// Delete a virtual machine instance.
    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<()>;

    /// Watch a single instance for phase changes.
    async fn watch_instance(&self, namespace: &str, name: &str)
        -> Result<WatchStream<InstancePhase>>;

    /// Open a raw TCP byte stream to `port` inside the named instance.
    async fn open_port_stream(&self, namespace: &str, name: &str, port: u16)
        -> Result<PortStream>;
}
