//! Builds VM disk images inside a KubeVirt cluster.
//!
//! A build creates data volumes, the secrets backing cloud-init and sysprep
//! disks, and a virtual machine instance attached to all of them. It then
//! connects over SSH, runs the provisioning commands and waits for the
//! instance to shut down. The data volumes that were asked for outlive the
//! build as the [`Artifact`]; everything else is deleted.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   Builder    │───▶│   Pipeline   │───▶│    Steps     │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!                            │                   │
//!                 compensation stack      ┌──────┴───────┐
//!                            │            ▼              ▼
//!                            ▼     ┌────────────┐ ┌────────────┐
//!                     ┌────────────┐│  Cluster   │ │   Shell    │
//!                     │  Unwind    ││  client    │ │ connector  │
//!                     └────────────┘└────────────┘ └────────────┘
//! ```

#![forbid(unsafe_code)]

pub mod artifact;
pub mod builder;
pub mod config;
pub mod context;
pub mod disk;
pub mod error;
pub mod pipeline;
pub mod shell;
pub mod steps;

pub use artifact::{Artifact, ArtifactManifest};
pub use builder::{BuildFailure, BuildOutcome, Builder};
pub use config::{BuildConfig, RawBuildConfig, SshConfig};
pub use context::{BuildContext, BuildOutputs, Slot};
pub use disk::{DataVolumeDisk, DeviceKind, DeviceSpec, DiskDescriptor};
pub use error::{BuildError, BuildResult};
pub use pipeline::{Compensation, Outcome, Pipeline, PipelineReport, Step};
pub use shell::{
    CommandOutput, HandshakeError, SessionError, ShellConnector, ShellCredentials, ShellSession,
    SshConnector,
};
