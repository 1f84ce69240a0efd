//! Sequential step runner with compensation.
//!
//! Steps run strictly one after another. When a step succeeds the runner asks
//! it for a [`Compensation`], the action that undoes its effect, and pushes it
//! onto a stack. When a step fails or the build is cancelled, forward progress
//! stops and the stack is drained from the top, so effects are undone in
//! reverse order. A failed compensation is logged and recorded as a warning;
//! the remaining compensations still run.

use std::fmt;

use async_trait::async_trait;
use kubebake_cluster::{ClusterClient, ClusterError, ResourceKind};
use tracing::{debug, info, warn};

use crate::context::BuildContext;
use crate::error::{BuildError, BuildResult};

/// Undo action for a completed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    DeleteDataVolume { namespace: String, name: String },
    DeleteSecret { namespace: String, name: String },
    DeleteInstance { namespace: String, name: String },
}

impl Compensation {
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::DeleteDataVolume { .. } => ResourceKind::DataVolume,
            Self::DeleteSecret { .. } => ResourceKind::Secret,
            Self::DeleteInstance { .. } => ResourceKind::VirtualMachineInstance,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::DeleteDataVolume { name, .. }
            | Self::DeleteSecret { name, .. }
            | Self::DeleteInstance { name, .. } => name,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        match self {
            Self::DeleteDataVolume { namespace, .. }
            | Self::DeleteSecret { namespace, .. }
            | Self::DeleteInstance { namespace, .. } => namespace,
        }
    }

    pub async fn execute(&self, cluster: &dyn ClusterClient) -> Result<(), ClusterError> {
        match self {
            Self::DeleteDataVolume { namespace, name } => {
                cluster.delete_data_volume(namespace, name).await
            }
            Self::DeleteSecret { namespace, name } => cluster.delete_secret(namespace, name).await,
            Self::DeleteInstance { namespace, name } => {
                cluster.delete_instance(namespace, name).await
            }
        }
    }
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delete {} {}/{}", self.kind(), self.namespace(), self.name())
    }
}

/// One unit of forward progress.
#[async_trait]
pub trait Step: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> String;

    /// Perform the step. An error halts the pipeline.
    async fn run(&self, ctx: &mut BuildContext) -> BuildResult<()>;

    /// Undo action, asked for only after `run` succeeded.
    fn compensation(&self, _ctx: &BuildContext) -> Option<Compensation> {
        None
    }
}

/// How a pipeline run ended.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    Halted(BuildError),
    Cancelled,
}

/// Outcome plus what was done to unwind.
#[derive(Debug)]
pub struct PipelineReport {
    pub outcome: Outcome,
    /// Compensations executed, in execution order.
    pub compensated: Vec<Compensation>,
    /// One entry per failed compensation.
    pub cleanup_warnings: Vec<String>,
}

impl PipelineReport {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Completed)
    }

    /// Convert to a result, dropping the warnings.
    pub fn into_result(self) -> BuildResult<()> {
        match self.outcome {
            Outcome::Completed => Ok(()),
            Outcome::Halted(err) => Err(err),
            Outcome::Cancelled => Err(BuildError::Cancelled),
        }
    }
}

/// An ordered list of steps.
#[derive(Default)]
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|s| s.name()))
            .finish()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    pub fn push(&mut self, step: impl Step + 'static) {
        self.steps.push(Box::new(step));
    }

    #[must_use]
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step, unwinding on failure or cancellation.
    pub async fn run(&self, ctx: &mut BuildContext) -> PipelineReport {
        let mut stack: Vec<Compensation> = Vec::new();
        let mut failure = None;

        for step in &self.steps {
            let name = step.name();
            if ctx.cancel.is_cancelled() {
                info!(step = %name, "build cancelled before step");
                failure = Some(BuildError::Cancelled);
                break;
            }

            debug!(step = %name, "running step");
            match step.run(ctx).await {
                Ok(()) => {
                    if let Some(compensation) = step.compensation(ctx) {
                        stack.push(compensation);
                    }
                }
                Err(err) => {
                    if err.is_cancellation() {
                        info!(step = %name, "step cancelled");
                    } else {
                        warn!(step = %name, error = %err, "step failed");
                    }
                    failure = Some(err);
                    break;
                }
            }
        }

        let Some(err) = failure else {
            return PipelineReport {
                outcome: Outcome::Completed,
                compensated: Vec::new(),
                cleanup_warnings: Vec::new(),
            };
        };

        let (compensated, cleanup_warnings) = unwind(ctx.cluster.as_ref(), stack).await;
        let outcome = if err.is_cancellation() {
            Outcome::Cancelled
        } else {
            Outcome::Halted(err)
        };

        PipelineReport {
            outcome,
            compensated,
            cleanup_warnings,
        }
    }
}

async fn unwind(
    cluster: &dyn ClusterClient,
    mut stack: Vec<Compensation>,
) -> (Vec<Compensation>, Vec<String>) {
    let mut done = Vec::with_capacity(stack.len());
    let mut warnings = Vec::new();

    while let Some(compensation) = stack.pop() {
        info!(
            kind = %compensation.kind(),
            namespace = compensation.namespace(),
            name = compensation.name(),
            "compensating"
        );
        match compensation.execute(cluster).await {
            Ok(()) => info!(name = compensation.name(), "deleted"),
            Err(err) => {
                warn!(
                    name = compensation.name(),
                    error = %err,
                    "cleanup failed, delete it manually"
                );
                warnings.push(format!("failed to {compensation}: {err}"));
            }
        }
        done.push(compensation);
    }

    (done, warnings)
}
