//! Disk descriptors.
//!
//! Each configured disk becomes one [`DiskDescriptor`]. A descriptor carries
//! an ordinal index among disks of its own kind; the index names the disk
//! (`datavolume-0`, `cloudinit-1`, ...) and selects the result slot holding
//! its backing resource's name.

use std::collections::BTreeMap;

use kubebake_cluster::types::{
    DataVolumeSource, Disk, DiskTarget, LocalObjectReference, Volume, VolumeSource,
};
use kubebake_cluster::Quantity;

use crate::context::BuildOutputs;
use crate::error::BuildResult;

const DISK_BUS: &str = "virtio";
const CDROM_BUS: &str = "sata";

/// Whether a disk is presented as a plain disk or a CD-ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceKind {
    #[default]
    Disk,
    Cdrom,
}

/// How a disk is attached to the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSpec {
    pub kind: DeviceKind,
    /// Zero leaves the boot order unspecified.
    pub boot_order: u32,
}

impl DeviceSpec {
    /// Bus the device is attached to.
    #[must_use]
    pub fn bus(&self) -> &'static str {
        match self.kind {
            DeviceKind::Disk => DISK_BUS,
            DeviceKind::Cdrom => CDROM_BUS,
        }
    }

    fn target(&self) -> DiskTarget {
        let bus = self.bus().to_owned();
        match self.kind {
            DeviceKind::Disk => DiskTarget::Disk { bus },
            DeviceKind::Cdrom => DiskTarget::Cdrom { bus },
        }
    }
}

/// A data volume to create for the build.
#[derive(Debug, Clone, PartialEq)]
pub struct DataVolumeDisk {
    /// Fixed name. Unnamed volumes get a generated name and are scratch
    /// unless primary.
    pub name: Option<String>,
    pub size: Quantity,
    pub volume_mode: Option<String>,
    pub storage_class_name: Option<String>,
    pub preallocation: bool,
    pub source: DataVolumeSource,
}

/// One disk attached to the build instance.
#[derive(Debug, Clone, PartialEq)]
pub enum DiskDescriptor {
    /// Backed by a data volume. Index 0 is the primary volume.
    DataVolume {
        index: usize,
        volume: DataVolumeDisk,
        device: DeviceSpec,
    },
    /// Backed by a container image; owns no cluster resource.
    ContainerImage {
        index: usize,
        image: String,
        device: DeviceSpec,
    },
    /// Config drive whose user data comes from a secret.
    CloudInit {
        index: usize,
        files: BTreeMap<String, String>,
        device: DeviceSpec,
    },
    /// Sysprep answer files stored in a secret.
    Sysprep {
        index: usize,
        files: BTreeMap<String, String>,
        device: DeviceSpec,
    },
}

impl DiskDescriptor {
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::DataVolume { index, .. }
            | Self::ContainerImage { index, .. }
            | Self::CloudInit { index, .. }
            | Self::Sysprep { index, .. } => *index,
        }
    }

    /// Name shared by the disk and volume entries of the instance.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::DataVolume { index, .. } => format!("datavolume-{index}"),
            Self::ContainerImage { index, .. } => format!("containerdisk-{index}"),
            Self::CloudInit { index, .. } => format!("cloudinit-{index}"),
            Self::Sysprep { index, .. } => format!("sysprep-{index}"),
        }
    }

    #[must_use]
    pub fn device(&self) -> &DeviceSpec {
        match self {
            Self::DataVolume { device, .. }
            | Self::ContainerImage { device, .. }
            | Self::CloudInit { device, .. }
            | Self::Sysprep { device, .. } => device,
        }
    }

    /// True for the data volume that becomes the build's artifact.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        matches!(self, Self::DataVolume { index: 0, .. })
    }

    /// The instance's disk entry.
    #[must_use]
    pub fn disk(&self) -> Disk {
        let device = self.device();
        Disk {
            name: self.name(),
            boot_order: (device.boot_order > 0).then_some(device.boot_order),
            target: device.target(),
        }
    }

    /// The instance's volume entry.
    ///
    /// Fails if the backing resource's name has not been recorded yet.
    pub fn volume(&self, outputs: &BuildOutputs) -> BuildResult<Volume> {
        let source = match self {
            Self::DataVolume { index, .. } => VolumeSource::DataVolume {
                name: outputs.data_volume(*index)?.to_owned(),
            },
            Self::ContainerImage { image, .. } => VolumeSource::ContainerDisk {
                image: image.clone(),
            },
            Self::CloudInit { index, .. } => VolumeSource::CloudInitConfigDrive {
                user_data_secret_ref: LocalObjectReference::new(
                    outputs.cloud_init_secret(*index)?,
                ),
            },
            Self::Sysprep { index, .. } => VolumeSource::Sysprep {
                secret: LocalObjectReference::new(outputs.sysprep_secret(*index)?),
            },
        };
        Ok(Volume {
            name: self.name(),
            source,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::error::BuildError;

    fn cloud_init(index: usize) -> DiskDescriptor {
        DiskDescriptor::CloudInit {
            index,
            files: BTreeMap::from([("user-data".to_owned(), "#cloud-config".to_owned())]),
            device: DeviceSpec {
                kind: DeviceKind::Cdrom,
                boot_order: 0,
            },
        }
    }

    #[test]
    fn cdrom_uses_sata_and_omits_unset_boot_order() {
        let disk = cloud_init(1).disk();
        assert_eq!(disk.name, "cloudinit-1");
        assert_eq!(disk.boot_order, None);
        assert_eq!(
            disk.target,
            DiskTarget::Cdrom {
                bus: "sata".to_owned()
            }
        );
    }

    #[test]
    fn explicit_boot_order_is_kept() {
        let descriptor = DiskDescriptor::ContainerImage {
            index: 0,
            image: "quay.io/containerdisks/fedora:40".to_owned(),
            device: DeviceSpec {
                kind: DeviceKind::Disk,
                boot_order: 2,
            },
        };
        let disk = descriptor.disk();
        assert_eq!(disk.boot_order, Some(2));
        assert_eq!(
            disk.target,
            DiskTarget::Disk {
                bus: "virtio".to_owned()
            }
        );
    }

    #[rstest]
    #[case::data_volume(DiskDescriptor::DataVolume {
        index: 1,
        volume: DataVolumeDisk {
            name: None,
            size: Quantity::parse("1Gi").unwrap(),
            volume_mode: None,
            storage_class_name: None,
            preallocation: false,
            source: DataVolumeSource::Blank {},
        },
        device: DeviceSpec::default(),
    }, Some("bake-dv001"))]
    #[case::container_image(DiskDescriptor::ContainerImage {
        index: 1,
        image: "quay.io/containerdisks/fedora:40".to_owned(),
        device: DeviceSpec::default(),
    }, None)]
    #[case::cloud_init(cloud_init(1), Some("bake-ci001"))]
    #[case::sysprep(DiskDescriptor::Sysprep {
        index: 1,
        files: BTreeMap::from([("unattend.xml".to_owned(), "<unattend/>".to_owned())]),
        device: DeviceSpec::default(),
    }, Some("bake-sp001"))]
    fn volume_references_the_recorded_name(
        #[case] descriptor: DiskDescriptor,
        #[case] expected: Option<&str>,
    ) {
        let mut outputs = BuildOutputs::with_counts(2, 2, 2);
        outputs.record_data_volume(0, "bake-dv000".to_owned()).unwrap();
        outputs.record_data_volume(1, "bake-dv001".to_owned()).unwrap();
        outputs.record_cloud_init_secret(1, "bake-ci001".to_owned()).unwrap();
        outputs.record_sysprep_secret(1, "bake-sp001".to_owned()).unwrap();

        let volume = descriptor.volume(&outputs).unwrap();

        assert_eq!(volume.name, descriptor.name());
        assert_eq!(volume.source.referenced_name(), expected);
        assert!(!descriptor.is_primary());
    }

    #[test]
    fn volume_needs_recorded_secret() {
        let outputs = BuildOutputs::with_counts(0, 1, 0);
        let err = cloud_init(0).volume(&outputs).unwrap_err();
        assert!(matches!(err, BuildError::MissingOutput(_)));
    }
}
