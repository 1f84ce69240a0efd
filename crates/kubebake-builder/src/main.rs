//! kubebake command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kubebake_builder::{ArtifactManifest, BuildConfig, Builder, SshConnector};
use kubebake_cluster::KubeClient;

#[derive(Parser)]
#[command(name = "kubebake")]
#[command(about = "Build VM disk images on KubeVirt")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a build
    Build {
        /// Build configuration file
        config: PathBuf,

        /// Replace existing data volumes with the same name
        #[arg(long)]
        force: bool,

        /// Write the artifact manifest to this file
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Check a configuration file without building
    Validate {
        config: PathBuf,
    },

    /// Delete the data volumes listed in an artifact manifest
    Destroy {
        manifest: PathBuf,

        /// Delete only this volume
        #[arg(long)]
        volume: Option<String>,

        /// Kubeconfig file (defaults to KUBECONFIG, then ~/.kube/config)
        #[arg(long)]
        kubeconfig: Option<PathBuf>,

        /// Kubeconfig context to use instead of the current one
        #[arg(long)]
        context: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kubebake=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            config,
            force,
            manifest,
        } => build(&config, force, manifest.as_deref()).await,
        Commands::Validate { config } => validate(&config),
        Commands::Destroy {
            manifest,
            volume,
            kubeconfig,
            context,
        } => {
            destroy(
                &manifest,
                volume.as_deref(),
                kubeconfig.as_deref(),
                context.as_deref(),
            )
            .await
        }
    }
}

async fn build(path: &Path, force: bool, manifest: Option<&Path>) -> anyhow::Result<()> {
    let mut config = BuildConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.force |= force;

    let cluster = KubeClient::infer(
        config.cluster.kubeconfig.as_deref(),
        config.cluster.context.as_deref(),
    )
    .context("failed to configure cluster access")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let builder = Builder::new(config, Arc::new(cluster), Arc::new(SshConnector::new()));
    let result = builder.run(cancel.clone()).await;
    cancel.cancel();

    match result {
        Ok(outcome) => {
            for warning in &outcome.warnings {
                warn!(warning = %warning, "teardown incomplete");
            }
            println!("{}", outcome.artifact);
            if let Some(path) = manifest {
                ArtifactManifest::new(outcome.artifact).write_to(path)?;
            }
            Ok(())
        }
        Err(failure) => {
            for warning in &failure.warnings {
                warn!(warning = %warning, "cleanup incomplete");
            }
            if failure.error.is_cancellation() {
                info!("build cancelled, created resources were removed");
            }
            Err(failure.error.into())
        }
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = BuildConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    info!(
        namespace = %config.namespace,
        disks = config.disks.len(),
        commands = config.provision.iter().map(|p| p.inline.len()).sum::<usize>(),
        "configuration is valid"
    );
    Ok(())
}

async fn destroy(
    path: &Path,
    volume: Option<&str>,
    kubeconfig: Option<&Path>,
    context: Option<&str>,
) -> anyhow::Result<()> {
    let manifest = ArtifactManifest::read_from(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let cluster = KubeClient::infer(kubeconfig, context)
        .context("failed to configure cluster access")?;

    match volume {
        Some(name) => {
            manifest.artifact.destroy_volume(&cluster, name).await?;
            info!(name = %name, "data volume destroyed");
        }
        None => {
            manifest.artifact.destroy(&cluster).await?;
            info!(id = %manifest.artifact.id(), "artifact destroyed");
        }
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, cancelling build");
        }
        () = terminate => {
            info!("received SIGTERM, cancelling build");
        }
        () = cancel.cancelled() => return,
    }
    cancel.cancel();
}
