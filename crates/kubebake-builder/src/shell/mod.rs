//! Remote shell boundary.
//!
//! A [`ShellConnector`] turns an open port stream into a [`ShellSession`].
//! Handshake failures are classified so the connect step can tell a wrong
//! password apart from an instance that is not listening yet.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use kubebake_cluster::PortStream;
use secrecy::SecretString;
use thiserror::Error;

mod ssh;

pub use ssh::SshConnector;

/// Principal and credential for the handshake.
#[derive(Debug)]
pub struct ShellCredentials {
    pub username: String,
    pub password: SecretString,
}

/// Why a handshake failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The server rejected the credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The stream broke before the handshake finished.
    #[error("connection lost during handshake: {0}")]
    Connection(String),

    /// Anything else.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Error from an established session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("shell session error: {0}")]
pub struct SessionError(pub String);

/// Result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: u32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// An authenticated remote shell.
#[async_trait]
pub trait ShellSession: Send + Sync {
    /// Run a command and wait for it to exit.
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SessionError>;

    /// End the session.
    async fn close(&mut self) -> Result<(), SessionError>;
}

impl fmt::Debug for dyn ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShellSession")
    }
}

/// Establishes shell sessions over port streams.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn handshake(
        &self,
        stream: PortStream,
        credentials: &ShellCredentials,
        keep_alive: Duration,
    ) -> Result<Box<dyn ShellSession>, HandshakeError>;
}
