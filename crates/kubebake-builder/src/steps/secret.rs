use async_trait::async_trait;
use kubebake_cluster::{ResourceName, SecretSpec};
use tracing::info;

use super::GENERATED_PREFIX;
use crate::context::BuildContext;
use crate::error::{BuildError, BuildResult};
use crate::pipeline::{Compensation, Step};

/// Which disk a secret backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretTarget {
    CloudInit(usize),
    Sysprep(usize),
}

/// Create the secret holding a cloud-init or sysprep disk's files.
///
/// Secrets have no asynchronous phase, so there is no matching wait step.
#[derive(Debug, Clone, Copy)]
pub struct CreateSecret {
    target: SecretTarget,
}

impl CreateSecret {
    #[must_use]
    pub fn new(target: SecretTarget) -> Self {
        Self { target }
    }

    fn recorded<'a>(&self, ctx: &'a BuildContext) -> BuildResult<&'a str> {
        match self.target {
            SecretTarget::CloudInit(index) => ctx.outputs.cloud_init_secret(index),
            SecretTarget::Sysprep(index) => ctx.outputs.sysprep_secret(index),
        }
    }
}

#[async_trait]
impl Step for CreateSecret {
    fn name(&self) -> String {
        match self.target {
            SecretTarget::CloudInit(index) => format!("create-cloudinit-secret-{index}"),
            SecretTarget::Sysprep(index) => format!("create-sysprep-secret-{index}"),
        }
    }

    async fn run(&self, ctx: &mut BuildContext) -> BuildResult<()> {
        let files = match self.target {
            SecretTarget::CloudInit(index) => ctx.config.cloud_init_files(index)?,
            SecretTarget::Sysprep(index) => ctx.config.sysprep_files(index)?,
        };
        let spec = SecretSpec {
            string_data: files.clone(),
        };

        let created = ctx
            .cluster
            .create_secret(
                ctx.namespace(),
                &ResourceName::generated(GENERATED_PREFIX),
                &spec,
            )
            .await
            .map_err(|e| BuildError::cluster("create secret", e))?;
        info!(namespace = ctx.namespace(), name = %created, files = spec.string_data.len(), "secret created");

        match self.target {
            SecretTarget::CloudInit(index) => ctx.outputs.record_cloud_init_secret(index, created),
            SecretTarget::Sysprep(index) => ctx.outputs.record_sysprep_secret(index, created),
        }
    }

    fn compensation(&self, ctx: &BuildContext) -> Option<Compensation> {
        let name = self.recorded(ctx).ok()?;
        Some(Compensation::DeleteSecret {
            namespace: ctx.namespace().to_owned(),
            name: name.to_owned(),
        })
    }
}
