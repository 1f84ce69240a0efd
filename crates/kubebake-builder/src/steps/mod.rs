//! The build steps.
//!
//! Resource creation is split into a create step, which records the name and
//! owns the compensation, and a wait step, which only watches. A failing wait
//! therefore owes nothing itself while the resource it watched is still
//! removed by its create step's compensation.

use std::ops::ControlFlow;

use futures::StreamExt;
use kubebake_cluster::{ResourcePhase, WatchStream};
use tokio_util::sync::CancellationToken;

use crate::error::{BuildError, BuildResult};

mod connect;
mod data_volume;
mod instance;
mod provision;
mod secret;
mod wait_instance;

pub use connect::{
    Action, Backoff, ConnectEvent, ConnectMachine, ConnectShell, ConnectState, Next,
};
pub use data_volume::{classify_data_volume, data_volume_spec, CreateDataVolume, WaitForDataVolume};
pub use instance::{instance_spec, CreateInstance};
pub use provision::Provision;
pub use secret::{CreateSecret, SecretTarget};
pub use wait_instance::{classify_instance, WaitForInstance};

/// Prefix for generated resource names.
pub const GENERATED_PREFIX: &str = "bake-";

/// Read phases until `classify` breaks or the build is cancelled.
pub(crate) async fn watch_until<P, F>(
    cancel: &CancellationToken,
    mut stream: WatchStream<P>,
    name: &str,
    mut classify: F,
) -> BuildResult<()>
where
    P: ResourcePhase,
    F: FnMut(P) -> ControlFlow<BuildResult<()>>,
{
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BuildError::Cancelled),
            next = stream.next() => next,
        };

        match next {
            None => {
                return Err(BuildError::WatchClosed {
                    name: name.to_owned(),
                })
            }
            Some(Err(err)) => return Err(BuildError::cluster(format!("watch {name}"), err)),
            Some(Ok(phase)) => {
                if let ControlFlow::Break(result) = classify(phase) {
                    return result;
                }
            }
        }
    }
}
