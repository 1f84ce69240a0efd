//! SSH over a port stream, using russh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kubebake_cluster::PortStream;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use secrecy::ExposeSecret;
use tracing::debug;

use super::{
    CommandOutput, HandshakeError, SessionError, ShellConnector, ShellCredentials, ShellSession,
};

/// Accepts any host key. Build instances are fresh and have no known key.
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Errors that mean the peer went away rather than refused us.
fn classify(err: russh::Error) -> HandshakeError {
    match err {
        russh::Error::IO(_)
        | russh::Error::Disconnect
        | russh::Error::HUP
        | russh::Error::ConnectionTimeout => HandshakeError::Connection(err.to_string()),
        other => HandshakeError::Protocol(other.to_string()),
    }
}

/// Password-authenticated SSH connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl SshConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn handshake(
        &self,
        stream: PortStream,
        credentials: &ShellCredentials,
        keep_alive: Duration,
    ) -> Result<Box<dyn ShellSession>, HandshakeError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(keep_alive),
            ..Default::default()
        });

        let mut handle = client::connect_stream(config, stream, AcceptAnyHostKey)
            .await
            .map_err(classify)?;

        let accepted = handle
            .authenticate_password(
                credentials.username.clone(),
                credentials.password.expose_secret(),
            )
            .await
            .map_err(classify)?;
        if !accepted {
            return Err(HandshakeError::Authentication(format!(
                "password rejected for user {}",
                credentials.username
            )));
        }

        debug!(user = %credentials.username, "ssh session established");
        Ok(Box::new(SshSession { handle }))
    }
}

struct SshSession {
    handle: Handle<AcceptAnyHostKey>,
}

fn session_error(err: russh::Error) -> SessionError {
    SessionError(err.to_string())
}

#[async_trait]
impl ShellSession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SessionError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(session_error)?;
        channel.exec(true, command).await.map_err(session_error)?;

        let mut output = CommandOutput::default();
        let mut exit_status = None;
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    output.stderr.extend_from_slice(data);
                }
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }

        output.exit_status = exit_status
            .ok_or_else(|| SessionError(format!("{command:?} exited without a status")))?;
        debug!(command, exit_status = output.exit_status, "remote command finished");
        Ok(output)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(session_error)
    }
}
