//! In-memory cluster for tests and dry runs.
//!
//! `MemoryCluster` stores every created resource, records each call in order,
//! and returns scripted watch phases and port stream outcomes so builds can be
//! driven through success, failure and cancellation paths without a cluster.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::DuplexStream;
use tracing::debug;

use crate::client::{ClusterClient, PortStream, WatchStream};
use crate::error::{ClusterError, Result};
use crate::types::{
    DataVolumePhase, DataVolumeSpec, InstancePhase, InstanceSpec, ResourceKind, ResourceName,
    ResourcePhase, SecretSpec,
};

const PORT_BUFFER: usize = 4096;

/// A call made against the memory cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    Create { kind: ResourceKind, name: String },
    Get { kind: ResourceKind, name: String },
    Delete { kind: ResourceKind, name: String },
    Watch { kind: ResourceKind, name: String },
    OpenPortStream { name: String, port: u16 },
}

/// Phases a watch stream will emit.
#[derive(Debug, Clone)]
pub struct WatchScript<P> {
    phases: Vec<P>,
    close: bool,
}

impl<P> WatchScript<P> {
    /// Emit these phases, then stay open without further events.
    #[must_use]
    pub fn new(phases: Vec<P>) -> Self {
        Self {
            phases,
            close: false,
        }
    }

    /// End the stream after the scripted phases instead of staying open.
    #[must_use]
    pub fn then_close(mut self) -> Self {
        self.close = true;
        self
    }
}

/// Outcome of the next port stream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAttempt {
    Accept,
    Refuse,
}

#[derive(Debug, Clone)]
struct StoredDataVolume {
    spec: Option<DataVolumeSpec>,
    phase: DataVolumePhase,
}

#[derive(Debug, Clone)]
struct StoredInstance {
    spec: InstanceSpec,
    phase: InstancePhase,
}

#[derive(Default)]
struct State {
    data_volumes: BTreeMap<(String, String), StoredDataVolume>,
    secrets: BTreeMap<(String, String), SecretSpec>,
    instances: BTreeMap<(String, String), StoredInstance>,
    data_volume_watches: VecDeque<WatchScript<DataVolumePhase>>,
    instance_watches: VecDeque<WatchScript<InstancePhase>>,
    port_attempts: VecDeque<PortAttempt>,
    open_ports: Vec<DuplexStream>,
    failing_creates: HashSet<ResourceKind>,
    failing_deletes: HashSet<String>,
    calls: Vec<ClusterCall>,
}

impl State {
    fn taken(&self, kind: ResourceKind, namespace: &str, name: &str) -> bool {
        let key = (namespace.to_owned(), name.to_owned());
        match kind {
            ResourceKind::DataVolume => self.data_volumes.contains_key(&key),
            ResourceKind::Secret => self.secrets.contains_key(&key),
            ResourceKind::VirtualMachineInstance => self.instances.contains_key(&key),
        }
    }

    fn allocate(&mut self, kind: ResourceKind, namespace: &str, name: &ResourceName) -> Result<String> {
        self.calls.push(ClusterCall::Create {
            kind,
            name: match name {
                ResourceName::Fixed(n) | ResourceName::Generated(n) => n.clone(),
            },
        });

        if self.failing_creates.remove(&kind) {
            return Err(ClusterError::Injected(format!("create {kind}")));
        }

        let final_name = match name {
            ResourceName::Fixed(n) => {
                if self.taken(kind, namespace, n) {
                    return Err(ClusterError::AlreadyExists {
                        kind,
                        namespace: namespace.to_owned(),
                        name: n.clone(),
                    });
                }
                n.clone()
            }
            ResourceName::Generated(prefix) => loop {
                let candidate = format!("{prefix}{}", random_suffix());
                if !self.taken(kind, namespace, &candidate) {
                    break candidate;
                }
            },
        };

        // Record the final name so call logs match what later deletes use.
        if let Some(ClusterCall::Create { name, .. }) = self.calls.last_mut() {
            name.clone_from(&final_name);
        }
        Ok(final_name)
    }

    fn delete(&mut self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        self.calls.push(ClusterCall::Delete {
            kind,
            name: name.to_owned(),
        });

        if self.failing_deletes.contains(name) {
            return Err(ClusterError::Injected(format!("delete {kind} {name}")));
        }

        let key = (namespace.to_owned(), name.to_owned());
        let removed = match kind {
            ResourceKind::DataVolume => self.data_volumes.remove(&key).is_some(),
            ResourceKind::Secret => self.secrets.remove(&key).is_some(),
            ResourceKind::VirtualMachineInstance => self.instances.remove(&key).is_some(),
        };

        if removed {
            Ok(())
        } else {
            Err(not_found(kind, namespace, name))
        }
    }
}

/// In-memory [`ClusterClient`].
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl std::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCluster").finish_non_exhaustive()
    }
}

impl MemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the phases for the next data volume watch.
    ///
    /// Watches without a queued script emit `Succeeded`.
    pub fn script_data_volume_watch(&self, script: WatchScript<DataVolumePhase>) {
        self.lock().data_volume_watches.push_back(script);
    }

    /// Queue the phases for the next instance watch.
    ///
    /// Watches without a queued script emit `Running` then `Succeeded`.
    pub fn script_instance_watch(&self, script: WatchScript<InstancePhase>) {
        self.lock().instance_watches.push_back(script);
    }

    /// Refuse the next `count` port stream attempts.
    pub fn refuse_port_streams(&self, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            state.port_attempts.push_back(PortAttempt::Refuse);
        }
    }

    /// Queue explicit port stream outcomes.
    pub fn script_port_streams(&self, attempts: impl IntoIterator<Item = PortAttempt>) {
        self.lock().port_attempts.extend(attempts);
    }

    /// Make the next create of `kind` fail.
    pub fn fail_next_create(&self, kind: ResourceKind) {
        self.lock().failing_creates.insert(kind);
    }

    /// Make every delete of `name` fail.
    pub fn fail_delete(&self, name: impl Into<String>) {
        self.lock().failing_deletes.insert(name.into());
    }

    /// Seed an existing data volume, as if left over from an earlier build.
    pub fn insert_data_volume(&self, namespace: &str, name: &str, phase: DataVolumePhase) {
        self.lock().data_volumes.insert(
            (namespace.to_owned(), name.to_owned()),
            StoredDataVolume { spec: None, phase },
        );
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ClusterCall> {
        self.lock().calls.clone()
    }

    /// Names of resources of `kind` that were deleted, in call order.
    #[must_use]
    pub fn deleted(&self, kind: ResourceKind) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ClusterCall::Delete { kind: k, name } if *k == kind => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Names of resources of `kind` that were created, in call order.
    #[must_use]
    pub fn created(&self, kind: ResourceKind) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ClusterCall::Create { kind: k, name } if *k == kind => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn data_volume(&self, namespace: &str, name: &str) -> Option<DataVolumeSpec> {
        self.lock()
            .data_volumes
            .get(&(namespace.to_owned(), name.to_owned()))
            .and_then(|dv| dv.spec.clone())
    }

    #[must_use]
    pub fn secret(&self, namespace: &str, name: &str) -> Option<SecretSpec> {
        self.lock()
            .secrets
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    #[must_use]
    pub fn instance(&self, namespace: &str, name: &str) -> Option<InstanceSpec> {
        self.lock()
            .instances
            .get(&(namespace.to_owned(), name.to_owned()))
            .map(|vmi| vmi.spec.clone())
    }

    /// Names of the resources of `kind` that currently exist in `namespace`.
    #[must_use]
    pub fn existing(&self, kind: ResourceKind, namespace: &str) -> Vec<String> {
        let state = self.lock();
        let keys: Vec<&(String, String)> = match kind {
            ResourceKind::DataVolume => state.data_volumes.keys().collect(),
            ResourceKind::Secret => state.secrets.keys().collect(),
            ResourceKind::VirtualMachineInstance => state.instances.keys().collect(),
        };
        keys.into_iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn create_data_volume(
        &self,
        namespace: &str,
        name: &ResourceName,
        spec: &DataVolumeSpec,
    ) -> Result<String> {
        let mut state = self.lock();
        let name = state.allocate(ResourceKind::DataVolume, namespace, name)?;
        state.data_volumes.insert(
            (namespace.to_owned(), name.clone()),
            StoredDataVolume {
                spec: Some(spec.clone()),
                phase: DataVolumePhase::Unset,
            },
        );
        debug!(namespace, name = %name, "memory data volume created");
        Ok(name)
    }

    async fn get_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DataVolumePhase>> {
        let mut state = self.lock();
        state.calls.push(ClusterCall::Get {
            kind: ResourceKind::DataVolume,
            name: name.to_owned(),
        });
        Ok(state
            .data_volumes
            .get(&(namespace.to_owned(), name.to_owned()))
            .map(|dv| dv.phase.clone()))
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()> {
        self.lock().delete(ResourceKind::DataVolume, namespace, name)
    }

    async fn watch_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WatchStream<DataVolumePhase>> {
        let mut state = self.lock();
        state.calls.push(ClusterCall::Watch {
            kind: ResourceKind::DataVolume,
            name: name.to_owned(),
        });
        let script = state
            .data_volume_watches
            .pop_front()
            .unwrap_or_else(|| WatchScript::new(vec![DataVolumePhase::Succeeded]));

        let stored = state
            .data_volumes
            .get_mut(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(|| not_found(ResourceKind::DataVolume, namespace, name))?;
        if let Some(last) = script.phases.last() {
            stored.phase = last.clone();
        }
        Ok(scripted_stream(script))
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &ResourceName,
        spec: &SecretSpec,
    ) -> Result<String> {
        let mut state = self.lock();
        let name = state.allocate(ResourceKind::Secret, namespace, name)?;
        state
            .secrets
            .insert((namespace.to_owned(), name.clone()), spec.clone());
        Ok(name)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.lock().delete(ResourceKind::Secret, namespace, name)
    }

    async fn create_instance(
        &self,
        namespace: &str,
        name: &ResourceName,
        spec: &InstanceSpec,
    ) -> Result<String> {
        let mut state = self.lock();
        let name = state.allocate(ResourceKind::VirtualMachineInstance, namespace, name)?;
        state.instances.insert(
            (namespace.to_owned(), name.clone()),
            StoredInstance {
                spec: spec.clone(),
                phase: InstancePhase::Pending,
            },
        );
        Ok(name)
    }

    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<InstancePhase>> {
        let mut state = self.lock();
        state.calls.push(ClusterCall::Get {
            kind: ResourceKind::VirtualMachineInstance,
            name: name.to_owned(),
        });
        Ok(state
            .instances
            .get(&(namespace.to_owned(), name.to_owned()))
            .map(|vmi| vmi.phase.clone()))
    }

    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<()> {
        self.lock()
            .delete(ResourceKind::VirtualMachineInstance, namespace, name)
    }

    async fn watch_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WatchStream<InstancePhase>> {
        let mut state = self.lock();
        state.calls.push(ClusterCall::Watch {
            kind: ResourceKind::VirtualMachineInstance,
            name: name.to_owned(),
        });
        let script = state.instance_watches.pop_front().unwrap_or_else(|| {
            WatchScript::new(vec![InstancePhase::Running, InstancePhase::Succeeded])
        });

        let stored = state
            .instances
            .get_mut(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(|| not_found(ResourceKind::VirtualMachineInstance, namespace, name))?;
        if let Some(last) = script.phases.last() {
            stored.phase = last.clone();
        }
        Ok(scripted_stream(script))
    }

    async fn open_port_stream(&self, namespace: &str, name: &str, port: u16) -> Result<PortStream> {
        let mut state = self.lock();
        state.calls.push(ClusterCall::OpenPortStream {
            name: name.to_owned(),
            port,
        });

        let refused = |message: &str| ClusterError::PortStream {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            port,
            message: message.to_owned(),
        };

        if !state.taken(ResourceKind::VirtualMachineInstance, namespace, name) {
            return Err(refused("instance not found"));
        }

        match state.port_attempts.pop_front().unwrap_or(PortAttempt::Accept) {
            PortAttempt::Refuse => Err(refused("connection refused")),
            PortAttempt::Accept => {
                let (local, remote) = tokio::io::duplex(PORT_BUFFER);
                state.open_ports.push(remote);
                Ok(Box::new(local))
            }
        }
    }
}

fn scripted_stream<P: ResourcePhase>(script: WatchScript<P>) -> WatchStream<P> {
    let events = stream::iter(script.phases.into_iter().map(Ok));
    if script.close {
        events.boxed()
    } else {
        events.chain(stream::pending()).boxed()
    }
}

fn not_found(kind: ResourceKind, namespace: &str, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind,
        namespace: namespace.to_owned(),
        name: name.to_owned(),
    }
}

/// Five lowercase characters, like the suffix the API server appends to
/// generated names.
fn random_suffix() -> String {
    let id = ulid::Ulid::new().to_string().to_lowercase();
    id[id.len() - 5..].to_owned()
}
