use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::context::BuildContext;
use crate::error::{BuildError, BuildResult};
use crate::pipeline::Step;

/// Run the configured inline commands over the shell session, in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Provision;

#[async_trait]
impl Step for Provision {
    fn name(&self) -> String {
        "provision".to_owned()
    }

    async fn run(&self, ctx: &mut BuildContext) -> BuildResult<()> {
        let config = Arc::clone(&ctx.config);
        let session = ctx.outputs.shell.require_mut()?;

        let commands = config.provision.iter().flat_map(|p| p.inline.iter());
        for (i, command) in commands.enumerate() {
            info!(index = i, command = %command, "running provisioning command");

            let result = tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => return Err(BuildError::Cancelled),
                result = session.exec(command) => result,
            };
            let output = result.map_err(|e| BuildError::Provision {
                command: command.clone(),
                message: e.to_string(),
            })?;

            debug!(
                index = i,
                stdout = %String::from_utf8_lossy(&output.stdout),
                "command finished"
            );
            if !output.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
                warn!(index = i, exit_status = output.exit_status, stderr = %stderr, "command failed");
                return Err(BuildError::Provision {
                    command: command.clone(),
                    message: format!("exit status {}: {stderr}", output.exit_status),
                });
            }
        }
        Ok(())
    }
}
