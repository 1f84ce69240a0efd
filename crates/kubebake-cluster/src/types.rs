//! Resource specifications and status phases.
//!
//! The structures here serialize to the JSON shapes the Kubernetes, CDI and
//! KubeVirt APIs expect, so the HTTP client can submit them directly and the
//! in-memory client can store them for inspection.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of cluster resource managed by a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    DataVolume,
    Secret,
    VirtualMachineInstance,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataVolume => write!(f, "data volume"),
            Self::Secret => write!(f, "secret"),
            Self::VirtualMachineInstance => write!(f, "virtual machine instance"),
        }
    }
}

/// How a new resource is named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceName {
    /// Use exactly this name.
    Fixed(String),
    /// Let the cluster append a random suffix to this prefix.
    Generated(String),
}

impl ResourceName {
    #[must_use]
    pub fn fixed(name: impl Into<String>) -> Self {
        Self::Fixed(name.into())
    }

    #[must_use]
    pub fn generated(prefix: impl Into<String>) -> Self {
        Self::Generated(prefix.into())
    }
}

// =============================================================================
// Quantities
// =============================================================================

static QUANTITY_PATTERN: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(
        r"^[+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:[eE][+-]?[0-9]+|Ki|Mi|Gi|Ti|Pi|Ei|[numkMGTPE])?$",
    )
});

/// Error returned when a string is not a valid resource quantity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("quantities must match the regular expression '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$': {0:?}")]
pub struct QuantityError(pub String);

/// A validated cluster resource quantity such as `4`, `500m` or `10Gi`.
///
/// The original string is preserved; the API server normalizes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity(String);

impl Quantity {
    /// Parse and validate a quantity string.
    pub fn parse(value: &str) -> Result<Self, QuantityError> {
        let valid = match &*QUANTITY_PATTERN {
            Ok(re) => re.is_match(value),
            Err(_) => false,
        };
        if valid {
            Ok(Self(value.to_owned()))
        } else {
            Err(QuantityError(value.to_owned()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Quantity {
    type Error = QuantityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Phases
// =============================================================================

/// Status phase carried by a watch event.
pub trait ResourcePhase: Send + fmt::Debug + 'static {
    /// Decode the raw `status.phase` string. An empty string means the
    /// controller has not reported a phase yet.
    fn from_raw(raw: &str) -> Self;
}

/// Lifecycle phase of a data volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataVolumePhase {
    /// No phase reported yet.
    Unset,
    Pending,
    ImportScheduled,
    ImportInProgress,
    Succeeded,
    Failed,
    /// Any phase outside the recognized set.
    Other(String),
}

impl ResourcePhase for DataVolumePhase {
    fn from_raw(raw: &str) -> Self {
        match raw {
            "" => Self::Unset,
            "Pending" => Self::Pending,
            "ImportScheduled" => Self::ImportScheduled,
            "ImportInProgress" => Self::ImportInProgress,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for DataVolumePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, ""),
            Self::Pending => write!(f, "Pending"),
            Self::ImportScheduled => write!(f, "ImportScheduled"),
            Self::ImportInProgress => write!(f, "ImportInProgress"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Lifecycle phase of a virtual machine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstancePhase {
    Unset,
    Pending,
    Scheduling,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Unknown,
    Other(String),
}

impl ResourcePhase for InstancePhase {
    fn from_raw(raw: &str) -> Self {
        match raw {
            "" => Self::Unset,
            "Pending" => Self::Pending,
            "Scheduling" => Self::Scheduling,
            "Scheduled" => Self::Scheduled,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Unknown" => Self::Unknown,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, ""),
            Self::Pending => write!(f, "Pending"),
            Self::Scheduling => write!(f, "Scheduling"),
            Self::Scheduled => write!(f, "Scheduled"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

// =============================================================================
// Data volumes
// =============================================================================

/// Specification of a CDI data volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    pub source: DataVolumeSource,
    pub pvc: PersistentVolumeClaimSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preallocation: Option<bool>,
}

/// Where a data volume's initial contents come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataVolumeSource {
    Http { url: String },
    Registry { url: String },
    Blank {},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimSpec {
    pub access_modes: Vec<AccessMode>,
    pub resources: StorageResources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageResources {
    pub requests: StorageRequests,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRequests {
    pub storage: Quantity,
}

// =============================================================================
// Secrets
// =============================================================================

/// Literal file contents stored in a secret, keyed by file name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    pub string_data: BTreeMap<String, String>,
}

// =============================================================================
// Virtual machine instances
// =============================================================================

/// Specification of a KubeVirt virtual machine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub termination_grace_period_seconds: i64,
    pub domain: DomainSpec,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    pub machine: Machine,
    pub firmware: Firmware,
    pub resources: ComputeResources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
    pub devices: Devices,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(rename = "type")]
    pub machine_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firmware {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<Bootloader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootloader {
    pub efi: Efi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Efi {
    pub secure_boot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeResources {
    pub limits: ComputeQuantities,
    pub requests: ComputeQuantities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeQuantities {
    pub cpu: Quantity,
    pub memory: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub hugepages: Hugepages,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hugepages {
    pub page_size: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    pub autoattach_mem_balloon: bool,
    pub autoattach_graphics_device: bool,
    pub autoattach_serial_console: bool,
    pub rng: Rng,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<Gpu>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rng {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub model: String,
    pub masquerade: Masquerade,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Masquerade {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gpu {
    pub name: String,
    pub device_name: String,
}

/// A disk device attached to the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<u32>,
    #[serde(flatten)]
    pub target: DiskTarget,
}

/// Device kind and bus of a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiskTarget {
    Disk { bus: String },
    Cdrom { bus: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub pod: PodNetwork,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodNetwork {}

/// A volume backing one of the instance's disks. The volume name matches
/// the disk name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(flatten)]
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    DataVolume {
        name: String,
    },
    ContainerDisk {
        image: String,
    },
    #[serde(rename_all = "camelCase")]
    CloudInitConfigDrive {
        user_data_secret_ref: LocalObjectReference,
    },
    Sysprep {
        secret: LocalObjectReference,
    },
}

impl VolumeSource {
    /// Name of the cluster resource this volume references, if any.
    #[must_use]
    pub fn referenced_name(&self) -> Option<&str> {
        match self {
            Self::DataVolume { name } => Some(name),
            Self::ContainerDisk { .. } => None,
            Self::CloudInitConfigDrive {
                user_data_secret_ref,
            } => Some(&user_data_secret_ref.name),
            Self::Sysprep { secret } => Some(&secret.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

impl LocalObjectReference {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}
