use std::ops::ControlFlow;

use async_trait::async_trait;
use kubebake_cluster::types::{
    AccessMode, PersistentVolumeClaimSpec, StorageRequests, StorageResources,
};
use kubebake_cluster::{DataVolumePhase, DataVolumeSpec, ResourceName};
use tracing::{debug, info};

use super::{watch_until, GENERATED_PREFIX};
use crate::context::BuildContext;
use crate::disk::DataVolumeDisk;
use crate::error::{BuildError, BuildResult};
use crate::pipeline::{Compensation, Step};

/// The CDI spec for a configured data volume.
#[must_use]
pub fn data_volume_spec(volume: &DataVolumeDisk) -> DataVolumeSpec {
    DataVolumeSpec {
        source: volume.source.clone(),
        pvc: PersistentVolumeClaimSpec {
            access_modes: vec![AccessMode::ReadWriteOnce],
            resources: StorageResources {
                requests: StorageRequests {
                    storage: volume.size.clone(),
                },
            },
            volume_mode: volume.volume_mode.clone(),
            storage_class_name: volume.storage_class_name.clone(),
        },
        preallocation: Some(volume.preallocation),
    }
}

/// Decide what a watched data volume phase means.
///
/// An unset phase is treated as not yet reported and ignored, like the
/// in-progress phases.
#[must_use]
pub fn classify_data_volume(name: &str, phase: DataVolumePhase) -> ControlFlow<BuildResult<()>> {
    match phase {
        DataVolumePhase::Succeeded => ControlFlow::Break(Ok(())),
        DataVolumePhase::Failed => ControlFlow::Break(Err(BuildError::DataVolumeFailed {
            name: name.to_owned(),
        })),
        DataVolumePhase::Unset
        | DataVolumePhase::Pending
        | DataVolumePhase::ImportScheduled
        | DataVolumePhase::ImportInProgress => {
            debug!(name, %phase, "data volume in progress");
            ControlFlow::Continue(())
        }
        DataVolumePhase::Other(phase) => {
            ControlFlow::Break(Err(BuildError::UnexpectedDataVolumePhase {
                name: name.to_owned(),
                phase,
            }))
        }
    }
}

/// Create the data volume for one data volume disk.
#[derive(Debug, Clone, Copy)]
pub struct CreateDataVolume {
    index: usize,
}

impl CreateDataVolume {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Step for CreateDataVolume {
    fn name(&self) -> String {
        format!("create-data-volume-{}", self.index)
    }

    async fn run(&self, ctx: &mut BuildContext) -> BuildResult<()> {
        let volume = ctx.config.data_volume(self.index)?;
        let name = match &volume.name {
            Some(name) => ResourceName::fixed(name),
            None => ResourceName::generated(GENERATED_PREFIX),
        };
        let spec = data_volume_spec(volume);

        let created = ctx
            .cluster
            .create_data_volume(ctx.namespace(), &name, &spec)
            .await
            .map_err(|e| BuildError::cluster("create data volume", e))?;
        info!(namespace = ctx.namespace(), name = %created, size = %volume.size, "data volume created");

        ctx.outputs.record_data_volume(self.index, created)
    }

    fn compensation(&self, ctx: &BuildContext) -> Option<Compensation> {
        let name = ctx.outputs.data_volume(self.index).ok()?;
        Some(Compensation::DeleteDataVolume {
            namespace: ctx.namespace().to_owned(),
            name: name.to_owned(),
        })
    }
}

/// Wait until a created data volume reaches `Succeeded`.
#[derive(Debug, Clone, Copy)]
pub struct WaitForDataVolume {
    index: usize,
}

impl WaitForDataVolume {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Step for WaitForDataVolume {
    fn name(&self) -> String {
        format!("wait-for-data-volume-{}", self.index)
    }

    async fn run(&self, ctx: &mut BuildContext) -> BuildResult<()> {
        let name = ctx.outputs.data_volume(self.index)?.to_owned();
        let stream = ctx
            .cluster
            .watch_data_volume(ctx.namespace(), &name)
            .await
            .map_err(|e| BuildError::cluster("watch data volume", e))?;

        info!(name = %name, "waiting for data volume");
        watch_until(&ctx.cancel, stream, &name, |phase| {
            classify_data_volume(&name, phase)
        })
        .await?;
        info!(name = %name, "data volume succeeded");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use kubebake_cluster::types::DataVolumeSource;
    use kubebake_cluster::Quantity;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(DataVolumePhase::Unset)]
    #[case(DataVolumePhase::Pending)]
    #[case(DataVolumePhase::ImportScheduled)]
    #[case(DataVolumePhase::ImportInProgress)]
    fn in_progress_phases_keep_watching(#[case] phase: DataVolumePhase) {
        assert!(classify_data_volume("dv", phase).is_continue());
    }

    #[test]
    fn succeeded_and_failed_are_terminal() {
        assert!(matches!(
            classify_data_volume("dv", DataVolumePhase::Succeeded),
            ControlFlow::Break(Ok(()))
        ));
        assert!(matches!(
            classify_data_volume("dv", DataVolumePhase::Failed),
            ControlFlow::Break(Err(BuildError::DataVolumeFailed { .. }))
        ));
    }

    #[test]
    fn unknown_phase_surfaces_its_name() {
        let flow = classify_data_volume("dv", DataVolumePhase::Other("Paused".into()));
        let ControlFlow::Break(Err(BuildError::UnexpectedDataVolumePhase { phase, .. })) = flow
        else {
            panic!("expected an unexpected phase error");
        };
        assert_eq!(phase, "Paused");
    }

    #[test]
    fn spec_carries_optional_fields() {
        let volume = DataVolumeDisk {
            name: None,
            size: Quantity::parse("20Gi").unwrap(),
            volume_mode: Some("Block".to_owned()),
            storage_class_name: Some("fast".to_owned()),
            preallocation: true,
            source: DataVolumeSource::Http {
                url: "https://example.com/disk.qcow2".to_owned(),
            },
        };
        let spec = data_volume_spec(&volume);

        assert_eq!(spec.pvc.volume_mode.as_deref(), Some("Block"));
        assert_eq!(spec.pvc.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(spec.preallocation, Some(true));
        assert_eq!(spec.pvc.resources.requests.storage.as_str(), "20Gi");
    }
}
