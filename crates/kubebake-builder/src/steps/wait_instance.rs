use std::ops::ControlFlow;

use async_trait::async_trait;
use kubebake_cluster::InstancePhase;
use tracing::{debug, info};

use super::watch_until;
use crate::context::BuildContext;
use crate::error::{BuildError, BuildResult};
use crate::pipeline::Step;

/// Decide what a watched instance phase means.
///
/// Only `Running` keeps the watch going; every phase other than `Succeeded`
/// is unexpected, including an unset one.
#[must_use]
pub fn classify_instance(name: &str, phase: InstancePhase) -> ControlFlow<BuildResult<()>> {
    match phase {
        InstancePhase::Succeeded => ControlFlow::Break(Ok(())),
        InstancePhase::Running => {
            debug!(name, "instance running");
            ControlFlow::Continue(())
        }
        other => ControlFlow::Break(Err(BuildError::UnexpectedInstancePhase {
            name: name.to_owned(),
            phase: other.to_string(),
        })),
    }
}

/// Wait until the build instance reaches `Succeeded`.
///
/// Owns no compensation; the instance is deleted by the step that created it.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitForInstance;

#[async_trait]
impl Step for WaitForInstance {
    fn name(&self) -> String {
        "wait-for-instance".to_owned()
    }

    async fn run(&self, ctx: &mut BuildContext) -> BuildResult<()> {
        let name = ctx.outputs.instance.require()?.clone();
        let stream = ctx
            .cluster
            .watch_instance(ctx.namespace(), &name)
            .await
            .map_err(|e| BuildError::cluster("watch virtual machine instance", e))?;

        info!(name = %name, "waiting for virtual machine instance to stop");
        watch_until(&ctx.cancel, stream, &name, |phase| {
            classify_instance(&name, phase)
        })
        .await?;
        info!(name = %name, "virtual machine instance succeeded");
        Ok(())
    }
}
