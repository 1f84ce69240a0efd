use async_trait::async_trait;
use kubebake_cluster::types::{
    Bootloader, ComputeQuantities, ComputeResources, Devices, DomainSpec, Efi, Firmware, Gpu,
    Hugepages, Interface, Machine, Masquerade, Memory, Network, PodNetwork, Rng,
};
use kubebake_cluster::{InstanceSpec, ResourceName};
use tracing::info;

use super::GENERATED_PREFIX;
use crate::config::BuildConfig;
use crate::context::{BuildContext, BuildOutputs};
use crate::error::{BuildError, BuildResult};
use crate::pipeline::{Compensation, Step};

const MACHINE_TYPE: &str = "q35";
const NETWORK_NAME: &str = "default";
const INTERFACE_MODEL: &str = "virtio";

/// Assemble the instance spec from configuration and recorded resource names.
///
/// Disks and volumes follow configuration order. Fails if a disk's backing
/// resource name has not been recorded.
pub fn instance_spec(config: &BuildConfig, outputs: &BuildOutputs) -> BuildResult<InstanceSpec> {
    let quantities = ComputeQuantities {
        cpu: config.cpu.clone(),
        memory: config.memory.clone(),
    };

    let bootloader = config.efi.then(|| Bootloader {
        efi: Efi {
            secure_boot: config.secure_boot,
        },
    });

    let memory = config.hugepages_page_size.as_ref().map(|size| Memory {
        hugepages: Hugepages {
            page_size: size.clone(),
        },
    });

    let gpus = config
        .gpus
        .iter()
        .enumerate()
        .map(|(i, device)| Gpu {
            name: format!("gpu{i}"),
            device_name: device.clone(),
        })
        .collect();

    let disks = config.disks.iter().map(|d| d.disk()).collect();
    let volumes = config
        .disks
        .iter()
        .map(|d| d.volume(outputs))
        .collect::<BuildResult<Vec<_>>>()?;

    Ok(InstanceSpec {
        termination_grace_period_seconds: 0,
        domain: DomainSpec {
            machine: Machine {
                machine_type: MACHINE_TYPE.to_owned(),
            },
            firmware: Firmware { bootloader },
            resources: ComputeResources {
                limits: quantities.clone(),
                requests: quantities,
            },
            memory,
            devices: Devices {
                autoattach_mem_balloon: false,
                autoattach_graphics_device: true,
                autoattach_serial_console: true,
                rng: Rng {},
                interfaces: vec![Interface {
                    name: NETWORK_NAME.to_owned(),
                    model: INTERFACE_MODEL.to_owned(),
                    masquerade: Masquerade {},
                }],
                disks,
                gpus,
            },
        },
        networks: vec![Network {
            name: NETWORK_NAME.to_owned(),
            pod: PodNetwork {},
        }],
        volumes,
    })
}

/// Create the build instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateInstance;

#[async_trait]
impl Step for CreateInstance {
    fn name(&self) -> String {
        "create-instance".to_owned()
    }

    async fn run(&self, ctx: &mut BuildContext) -> BuildResult<()> {
        let spec = instance_spec(&ctx.config, &ctx.outputs)?;
        let created = ctx
            .cluster
            .create_instance(
                ctx.namespace(),
                &ResourceName::generated(GENERATED_PREFIX),
                &spec,
            )
            .await
            .map_err(|e| BuildError::cluster("create virtual machine instance", e))?;
        info!(namespace = ctx.namespace(), name = %created, "virtual machine instance created");

        ctx.outputs.instance.record(created)
    }

    fn compensation(&self, ctx: &BuildContext) -> Option<Compensation> {
        let name = ctx.outputs.instance.get()?;
        Some(Compensation::DeleteInstance {
            namespace: ctx.namespace().to_owned(),
            name: name.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use kubebake_cluster::types::VolumeSource;

    use super::*;

    const CONFIG: &str = r#"
        efi = true
        hugepages_page_size = "2Mi"
        gpus = ["nvidia.com/TU104GL_Tesla_T4"]

        [ssh]
        username = "u"
        password = "p"

        [[disk]]
        type = "datavolume"
        size = "10Gi"
        boot_order = 1
        source = { type = "blank" }

        [[disk]]
        type = "containerdisk"
        image = "quay.io/containerdisks/fedora:40"

        [[disk]]
        type = "sysprep"
        device = "cdrom"
        files = { "unattend.xml" = "<unattend/>" }
    "#;

    #[test]
    fn spec_is_assembled_in_disk_order() {
        let config = BuildConfig::parse(CONFIG).unwrap();
        let mut outputs = BuildOutputs::for_disks(&config.disks);
        outputs.record_data_volume(0, "bake-aaaaa".to_owned()).unwrap();
        outputs.record_sysprep_secret(0, "bake-bbbbb".to_owned()).unwrap();

        let spec = instance_spec(&config, &outputs).unwrap();

        let bootloader = spec.domain.firmware.bootloader.unwrap();
        assert!(!bootloader.efi.secure_boot);
        assert_eq!(spec.domain.memory.unwrap().hugepages.page_size, "2Mi");
        assert_eq!(spec.domain.devices.gpus[0].name, "gpu0");
        assert_eq!(spec.domain.resources.limits.cpu.as_str(), "4");

        let disk_names: Vec<&str> = spec
            .domain
            .devices
            .disks
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(disk_names, vec!["datavolume-0", "containerdisk-0", "sysprep-0"]);
        assert_eq!(spec.domain.devices.disks[0].boot_order, Some(1));

        assert_eq!(spec.volumes[0].source.referenced_name(), Some("bake-aaaaa"));
        assert!(matches!(
            spec.volumes[1].source,
            VolumeSource::ContainerDisk { .. }
        ));
        assert_eq!(spec.volumes[2].source.referenced_name(), Some("bake-bbbbb"));
    }

    #[test]
    fn bios_has_no_bootloader() {
        let config = BuildConfig::parse(&CONFIG.replace("efi = true", "")).unwrap();
        let mut outputs = BuildOutputs::for_disks(&config.disks);
        outputs.record_data_volume(0, "dv".to_owned()).unwrap();
        outputs.record_sysprep_secret(0, "s".to_owned()).unwrap();

        let spec = instance_spec(&config, &outputs).unwrap();
        assert!(spec.domain.firmware.bootloader.is_none());
    }

    #[test]
    fn missing_secret_name_fails() {
        let config = BuildConfig::parse(CONFIG).unwrap();
        let mut outputs = BuildOutputs::for_disks(&config.disks);
        outputs.record_data_volume(0, "dv".to_owned()).unwrap();

        assert!(matches!(
            instance_spec(&config, &outputs),
            Err(BuildError::MissingOutput(_))
        ));
    }
}
