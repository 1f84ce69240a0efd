//! The state threaded through every build step.
//!
//! [`BuildContext`] owns the configuration and collaborators; its
//! [`BuildOutputs`] hold the results steps produce. Every result lives in a
//! [`Slot`] that can be written once, so a later step can read what an earlier
//! step recorded but never overwrite it.

use std::fmt;
use std::sync::Arc;

use kubebake_cluster::ClusterClient;
use tokio_util::sync::CancellationToken;

use crate::config::BuildConfig;
use crate::disk::DiskDescriptor;
use crate::error::{BuildError, BuildResult};
use crate::shell::{ShellConnector, ShellSession};

/// A write-once result.
pub struct Slot<T> {
    label: String,
    value: Option<T>,
}

impl<T> Slot<T> {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: None,
        }
    }

    /// Record the value. Fails if one was already recorded.
    pub fn record(&mut self, value: T) -> BuildResult<()> {
        if self.value.is_some() {
            return Err(BuildError::SlotAlreadyRecorded(self.label.clone()));
        }
        self.value = Some(value);
        Ok(())
    }

    #[must_use]
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    /// The recorded value, or [`BuildError::MissingOutput`].
    pub fn require(&self) -> BuildResult<&T> {
        self.value
            .as_ref()
            .ok_or_else(|| BuildError::MissingOutput(self.label.clone()))
    }

    pub fn require_mut(&mut self) -> BuildResult<&mut T> {
        self.value
            .as_mut()
            .ok_or_else(|| BuildError::MissingOutput(self.label.clone()))
    }

    /// Remove the value for teardown.
    pub fn take(&mut self) -> Option<T> {
        self.value.take()
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("label", &self.label)
            .field("value", &self.value)
            .finish()
    }
}

fn slots(kind: &str, count: usize) -> Vec<Slot<String>> {
    (0..count).map(|i| Slot::new(format!("{kind}[{i}]"))).collect()
}

fn indexed<'a>(slots: &'a [Slot<String>], kind: &str, index: usize) -> BuildResult<&'a str> {
    slots
        .get(index)
        .ok_or_else(|| BuildError::MissingOutput(format!("{kind}[{index}]")))?
        .require()
        .map(String::as_str)
}

fn indexed_mut<'a>(
    slots: &'a mut [Slot<String>],
    kind: &str,
    index: usize,
) -> BuildResult<&'a mut Slot<String>> {
    slots
        .get_mut(index)
        .ok_or_else(|| BuildError::MissingOutput(format!("{kind}[{index}]")))
}

/// Results recorded by steps.
pub struct BuildOutputs {
    data_volumes: Vec<Slot<String>>,
    cloud_init_secrets: Vec<Slot<String>>,
    sysprep_secrets: Vec<Slot<String>>,
    pub instance: Slot<String>,
    pub shell: Slot<Box<dyn ShellSession>>,
}

impl fmt::Debug for BuildOutputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildOutputs")
            .field("data_volumes", &self.data_volumes)
            .field("cloud_init_secrets", &self.cloud_init_secrets)
            .field("sysprep_secrets", &self.sysprep_secrets)
            .field("instance", &self.instance)
            .field("shell", &self.shell.get().is_some())
            .finish()
    }
}

impl BuildOutputs {
    /// Slots for the given number of data volumes and secrets.
    #[must_use]
    pub fn with_counts(data_volumes: usize, cloud_init: usize, sysprep: usize) -> Self {
        Self {
            data_volumes: slots("data_volume", data_volumes),
            cloud_init_secrets: slots("cloud_init_secret", cloud_init),
            sysprep_secrets: slots("sysprep_secret", sysprep),
            instance: Slot::new("instance"),
            shell: Slot::new("shell"),
        }
    }

    /// Slots sized for a disk list.
    #[must_use]
    pub fn for_disks(disks: &[DiskDescriptor]) -> Self {
        let count = |pred: fn(&DiskDescriptor) -> bool| disks.iter().filter(|d| pred(d)).count();
        Self::with_counts(
            count(|d| matches!(d, DiskDescriptor::DataVolume { .. })),
            count(|d| matches!(d, DiskDescriptor::CloudInit { .. })),
            count(|d| matches!(d, DiskDescriptor::Sysprep { .. })),
        )
    }

    pub fn data_volume(&self, index: usize) -> BuildResult<&str> {
        indexed(&self.data_volumes, "data_volume", index)
    }

    pub fn cloud_init_secret(&self, index: usize) -> BuildResult<&str> {
        indexed(&self.cloud_init_secrets, "cloud_init_secret", index)
    }

    pub fn sysprep_secret(&self, index: usize) -> BuildResult<&str> {
        indexed(&self.sysprep_secrets, "sysprep_secret", index)
    }

    pub fn record_data_volume(&mut self, index: usize, name: String) -> BuildResult<()> {
        indexed_mut(&mut self.data_volumes, "data_volume", index)?.record(name)
    }

    pub fn record_cloud_init_secret(&mut self, index: usize, name: String) -> BuildResult<()> {
        indexed_mut(&mut self.cloud_init_secrets, "cloud_init_secret", index)?.record(name)
    }

    pub fn record_sysprep_secret(&mut self, index: usize, name: String) -> BuildResult<()> {
        indexed_mut(&mut self.sysprep_secrets, "sysprep_secret", index)?.record(name)
    }

    /// Recorded data volume names by index; unrecorded entries are `None`.
    #[must_use]
    pub fn data_volume_names(&self) -> Vec<Option<&str>> {
        self.data_volumes
            .iter()
            .map(|s| s.get().map(String::as_str))
            .collect()
    }

    /// Every recorded secret name.
    #[must_use]
    pub fn secret_names(&self) -> Vec<&str> {
        self.cloud_init_secrets
            .iter()
            .chain(&self.sysprep_secrets)
            .filter_map(|s| s.get().map(String::as_str))
            .collect()
    }
}

/// Everything a step can see.
pub struct BuildContext {
    pub config: Arc<BuildConfig>,
    pub cluster: Arc<dyn ClusterClient>,
    pub shell: Arc<dyn ShellConnector>,
    /// Cancelled from outside to abort the build.
    pub cancel: CancellationToken,
    pub outputs: BuildOutputs,
}

impl BuildContext {
    #[must_use]
    pub fn new(
        config: Arc<BuildConfig>,
        cluster: Arc<dyn ClusterClient>,
        shell: Arc<dyn ShellConnector>,
        cancel: CancellationToken,
    ) -> Self {
        let outputs = BuildOutputs::for_disks(&config.disks);
        Self {
            config,
            cluster,
            shell,
            cancel,
            outputs,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("namespace", &self.config.namespace)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_write_once() {
        let mut slot = Slot::new("instance");
        assert!(matches!(slot.require(), Err(BuildError::MissingOutput(_))));

        slot.record("vm-abcde".to_owned()).unwrap();
        let err = slot.record("vm-other".to_owned()).unwrap_err();

        assert!(matches!(err, BuildError::SlotAlreadyRecorded(label) if label == "instance"));
        assert_eq!(slot.require().unwrap(), "vm-abcde");
    }

    #[test]
    fn indexed_outputs_are_independent() {
        let mut outputs = BuildOutputs::with_counts(2, 1, 1);
        outputs.record_data_volume(1, "bake-xyz12".to_owned()).unwrap();
        outputs.record_sysprep_secret(0, "bake-sys01".to_owned()).unwrap();

        assert!(outputs.data_volume(0).is_err());
        assert_eq!(outputs.data_volume(1).unwrap(), "bake-xyz12");
        assert_eq!(outputs.data_volume_names(), vec![None, Some("bake-xyz12")]);
        assert_eq!(outputs.secret_names(), vec!["bake-sys01"]);
        assert!(outputs.record_data_volume(5, "nope".to_owned()).is_err());
    }
}
