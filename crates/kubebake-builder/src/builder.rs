//! Build orchestration.
//!
//! [`Builder::run`] checks for leftover volumes, runs the step pipeline and,
//! on success, tears down the transient resources before returning the
//! artifact. On failure the pipeline has already unwound everything it
//! created.

use std::sync::Arc;

use kubebake_cluster::ClusterClient;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifact::Artifact;
use crate::config::BuildConfig;
use crate::context::BuildContext;
use crate::disk::DiskDescriptor;
use crate::error::{BuildError, BuildResult};
use crate::pipeline::{Pipeline, Step};
use crate::shell::ShellConnector;
use crate::steps::{
    ConnectShell, CreateDataVolume, CreateInstance, CreateSecret, Provision, SecretTarget,
    WaitForDataVolume, WaitForInstance,
};

/// A finished build.
#[derive(Debug)]
pub struct BuildOutcome {
    pub artifact: Artifact,
    /// One entry per transient resource that could not be removed.
    pub warnings: Vec<String>,
}

/// A failed build, with any cleanup problems met while unwinding.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct BuildFailure {
    pub error: BuildError,
    pub warnings: Vec<String>,
}

impl From<BuildError> for BuildFailure {
    fn from(error: BuildError) -> Self {
        Self {
            error,
            warnings: Vec::new(),
        }
    }
}

/// Runs one build against a cluster.
pub struct Builder {
    config: Arc<BuildConfig>,
    cluster: Arc<dyn ClusterClient>,
    shell: Arc<dyn ShellConnector>,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Builder {
    #[must_use]
    pub fn new(
        config: BuildConfig,
        cluster: Arc<dyn ClusterClient>,
        shell: Arc<dyn ShellConnector>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            cluster,
            shell,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// The step list for this configuration.
    #[must_use]
    pub fn pipeline(&self) -> Pipeline {
        let disks = &self.config.disks;
        let data_volumes: Vec<usize> = self.config.data_volumes().map(|(i, _)| i).collect();

        let mut steps: Vec<Box<dyn Step>> = Vec::new();
        for &index in &data_volumes {
            steps.push(Box::new(CreateDataVolume::new(index)));
        }
        for &index in &data_volumes {
            steps.push(Box::new(WaitForDataVolume::new(index)));
        }
        for disk in disks {
            match disk {
                DiskDescriptor::CloudInit { index, .. } => {
                    steps.push(Box::new(CreateSecret::new(SecretTarget::CloudInit(*index))));
                }
                DiskDescriptor::Sysprep { index, .. } => {
                    steps.push(Box::new(CreateSecret::new(SecretTarget::Sysprep(*index))));
                }
                DiskDescriptor::DataVolume { .. } | DiskDescriptor::ContainerImage { .. } => {}
            }
        }
        steps.push(Box::new(CreateInstance));
        steps.push(Box::new(ConnectShell));
        steps.push(Box::new(Provision));
        steps.push(Box::new(WaitForInstance));

        Pipeline::new(steps)
    }

    /// Fail if a fixed-name data volume already exists, or delete it when
    /// `force` is set.
    pub async fn preflight(&self) -> BuildResult<()> {
        let namespace = &self.config.namespace;
        for name in self.config.fixed_volume_names() {
            let existing = self
                .cluster
                .get_data_volume(namespace, name)
                .await
                .map_err(|e| BuildError::cluster("look up data volume", e))?;
            if existing.is_none() {
                continue;
            }
            if !self.config.force {
                return Err(BuildError::VolumeExists {
                    namespace: namespace.clone(),
                    name: name.to_owned(),
                });
            }
            info!(namespace = %namespace, name = %name, "deleting existing data volume (force)");
            self.cluster
                .delete_data_volume(namespace, name)
                .await
                .map_err(|e| BuildError::cluster("delete existing data volume", e))?;
        }
        Ok(())
    }

    /// Run the build until it completes, fails or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<BuildOutcome, BuildFailure> {
        self.preflight().await?;

        let mut ctx = BuildContext::new(
            Arc::clone(&self.config),
            Arc::clone(&self.cluster),
            Arc::clone(&self.shell),
            cancel,
        );
        let pipeline = self.pipeline();
        info!(namespace = %self.config.namespace, steps = ?pipeline.step_names(), "starting build");

        let report = pipeline.run(&mut ctx).await;
        if !report.is_completed() {
            let warnings = report.cleanup_warnings.clone();
            let error = match report.into_result() {
                Ok(()) => BuildError::Cancelled,
                Err(err) => err,
            };
            return Err(BuildFailure { error, warnings });
        }

        let warnings = self.teardown(&mut ctx).await;
        let artifact = self.artifact(&ctx)?;
        info!(id = %artifact.id(), "build finished");
        Ok(BuildOutcome { artifact, warnings })
    }

    /// Remove the instance, every secret and every scratch data volume.
    async fn teardown(&self, ctx: &mut BuildContext) -> Vec<String> {
        let mut warnings = Vec::new();
        let namespace = self.config.namespace.as_str();

        if let Some(mut session) = ctx.outputs.shell.take() {
            if let Err(err) = session.close().await {
                warn!(error = %err, "failed to close shell session");
            }
        }

        if let Some(name) = ctx.outputs.instance.get() {
            info!(name = %name, "deleting virtual machine instance");
            match self.cluster.delete_instance(namespace, name).await {
                Ok(()) => info!(name = %name, "virtual machine instance deleted"),
                Err(err) => {
                    warn!(name = %name, error = %err, "failed to delete virtual machine instance");
                    warnings.push(format!("failed to delete virtual machine instance {name}: {err}"));
                }
            }
        }

        for name in ctx.outputs.secret_names() {
            info!(name = %name, "deleting secret");
            match self.cluster.delete_secret(namespace, name).await {
                Ok(()) => info!(name = %name, "secret deleted"),
                Err(err) => {
                    warn!(name = %name, error = %err, "failed to delete secret");
                    warnings.push(format!("failed to delete secret {name}: {err}"));
                }
            }
        }

        for (index, volume) in self.config.data_volumes() {
            if index == 0 || volume.name.is_some() {
                continue;
            }
            let Ok(name) = ctx.outputs.data_volume(index) else {
                continue;
            };
            info!(name = %name, "deleting scratch data volume");
            match self.cluster.delete_data_volume(namespace, name).await {
                Ok(()) => info!(name = %name, "data volume deleted"),
                Err(err) => {
                    warn!(name = %name, error = %err, "failed to delete data volume");
                    warnings.push(format!("failed to delete data volume {name}: {err}"));
                }
            }
        }

        warnings
    }

    /// The primary data volume plus every explicitly named one.
    fn artifact(&self, ctx: &BuildContext) -> BuildResult<Artifact> {
        let mut volumes = Vec::new();
        for (index, volume) in self.config.data_volumes() {
            if index == 0 || volume.name.is_some() {
                volumes.push(ctx.outputs.data_volume(index)?.to_owned());
            }
        }

        let mut artifact = Artifact::new(self.config.namespace.clone(), volumes);
        if let Some(instance) = ctx.outputs.instance.get() {
            artifact = artifact.with_data("instance", instance.clone());
        }
        Ok(artifact)
    }
}
