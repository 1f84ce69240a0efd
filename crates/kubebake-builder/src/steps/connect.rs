//! Shell connection.
//!
//! [`ConnectMachine`] decides what to do next from the outcome of the last
//! action; [`ConnectShell`] performs those actions and races each one against
//! the overall timeout and cancellation.
//!
//! Opening the port stream can fail while the instance is still booting.
//! Those failures are retried until the timeout and never use the handshake
//! budget, which only counts rejected credentials.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kubebake_cluster::{ClusterClient, PortStream};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::context::BuildContext;
use crate::error::{BuildError, BuildResult};
use crate::pipeline::Step;
use crate::shell::{HandshakeError, ShellConnector, ShellCredentials, ShellSession};

/// Where the connection attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Dialing,
    Handshaking,
    Connected,
    FailedAuth,
    FailedHandshake,
    FailedTimeout,
    Cancelled,
}

impl ConnectState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Dialing | Self::Handshaking)
    }
}

/// Outcome of the last action, or an outside signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectEvent {
    DialOk,
    DialErr(String),
    HandshakeOk,
    HandshakeAuthErr(String),
    HandshakeOtherErr(String),
    /// A backoff elapsed.
    Tick,
    Timeout,
    Cancel,
}

/// Which backoff to wait out before dialing again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// After a failed dial or a dropped handshake.
    Dial,
    /// After rejected credentials.
    Handshake,
}

/// What the driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Dial,
    Handshake,
    Backoff(Backoff),
}

/// Result of feeding an event to the machine.
#[derive(Debug)]
pub enum Next {
    Act(Action),
    Connected,
    Fail(BuildError),
}

/// Connection state machine.
#[derive(Debug, Clone)]
pub struct ConnectMachine {
    state: ConnectState,
    attempts: u32,
    budget: u32,
    timeout: Duration,
}

impl ConnectMachine {
    /// A machine that allows `budget` authentication failures in total and
    /// reports `timeout` when the overall deadline fires.
    #[must_use]
    pub fn new(budget: u32, timeout: Duration) -> Self {
        Self {
            state: ConnectState::Dialing,
            attempts: 0,
            budget,
            timeout,
        }
    }

    /// The first action.
    #[must_use]
    pub fn start(&self) -> Action {
        Action::Dial
    }

    #[must_use]
    pub fn state(&self) -> ConnectState {
        self.state
    }

    /// Authentication failures so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on(&mut self, event: ConnectEvent) -> Next {
        use ConnectState::{Dialing, Handshaking};

        match (self.state, event) {
            (_, ConnectEvent::Cancel) => {
                self.state = ConnectState::Cancelled;
                Next::Fail(BuildError::Cancelled)
            }
            (state, ConnectEvent::Timeout) if !state.is_terminal() => {
                self.state = ConnectState::FailedTimeout;
                Next::Fail(BuildError::ShellTimeout(self.timeout))
            }
            (Dialing, ConnectEvent::DialOk) => {
                self.state = Handshaking;
                Next::Act(Action::Handshake)
            }
            (Dialing | Handshaking, ConnectEvent::DialErr(_)) => {
                self.state = Dialing;
                Next::Act(Action::Backoff(Backoff::Dial))
            }
            (Dialing, ConnectEvent::Tick) => Next::Act(Action::Dial),
            (Handshaking, ConnectEvent::HandshakeOk) => {
                self.state = ConnectState::Connected;
                Next::Connected
            }
            (Handshaking, ConnectEvent::HandshakeAuthErr(message)) => {
                self.attempts += 1;
                if self.attempts >= self.budget {
                    self.state = ConnectState::FailedAuth;
                    Next::Fail(BuildError::HandshakeExhausted {
                        attempts: self.attempts,
                        message,
                    })
                } else {
                    self.state = Dialing;
                    Next::Act(Action::Backoff(Backoff::Handshake))
                }
            }
            (Handshaking, ConnectEvent::HandshakeOtherErr(message)) => {
                self.state = ConnectState::FailedHandshake;
                Next::Fail(BuildError::Handshake(message))
            }
            (state, event) => {
                self.state = ConnectState::FailedHandshake;
                Next::Fail(BuildError::Handshake(format!(
                    "unexpected {event:?} while {state:?}"
                )))
            }
        }
    }
}

/// Performs machine actions against the cluster and shell connector.
struct Dialer<'a> {
    cluster: &'a dyn ClusterClient,
    connector: &'a dyn ShellConnector,
    namespace: &'a str,
    instance: &'a str,
    port: u16,
    credentials: ShellCredentials,
    keep_alive: Duration,
    dial_backoff: Duration,
    handshake_backoff: Duration,
    stream: Option<PortStream>,
    session: Option<Box<dyn ShellSession>>,
}

impl Dialer<'_> {
    async fn perform(&mut self, action: Action) -> ConnectEvent {
        match action {
            Action::Dial => {
                match self
                    .cluster
                    .open_port_stream(self.namespace, self.instance, self.port)
                    .await
                {
                    Ok(stream) => {
                        self.stream = Some(stream);
                        ConnectEvent::DialOk
                    }
                    Err(err) => ConnectEvent::DialErr(err.to_string()),
                }
            }
            Action::Handshake => {
                let Some(stream) = self.stream.take() else {
                    return ConnectEvent::DialErr("no open port stream".to_owned());
                };
                match self
                    .connector
                    .handshake(stream, &self.credentials, self.keep_alive)
                    .await
                {
                    Ok(session) => {
                        self.session = Some(session);
                        ConnectEvent::HandshakeOk
                    }
                    Err(HandshakeError::Authentication(m)) => ConnectEvent::HandshakeAuthErr(m),
                    Err(HandshakeError::Connection(m)) => ConnectEvent::DialErr(m),
                    Err(HandshakeError::Protocol(m)) => ConnectEvent::HandshakeOtherErr(m),
                }
            }
            Action::Backoff(backoff) => {
                let wait = match backoff {
                    Backoff::Dial => self.dial_backoff,
                    Backoff::Handshake => self.handshake_backoff,
                };
                tokio::time::sleep(wait).await;
                ConnectEvent::Tick
            }
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dial => write!(f, "dial"),
            Self::Handshake => write!(f, "handshake"),
            Self::Backoff(Backoff::Dial) => write!(f, "dial backoff"),
            Self::Backoff(Backoff::Handshake) => write!(f, "handshake backoff"),
        }
    }
}

/// Establish a shell session with the build instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectShell;

#[async_trait]
impl Step for ConnectShell {
    fn name(&self) -> String {
        "connect-shell".to_owned()
    }

    async fn run(&self, ctx: &mut BuildContext) -> BuildResult<()> {
        let config = Arc::clone(&ctx.config);
        let ssh = &config.ssh;
        let instance = ctx.outputs.instance.require()?.clone();

        let mut machine = ConnectMachine::new(ssh.handshake_attempts, ssh.timeout);
        let mut dialer = Dialer {
            cluster: ctx.cluster.as_ref(),
            connector: ctx.shell.as_ref(),
            namespace: &config.namespace,
            instance: &instance,
            port: ssh.port,
            credentials: ShellCredentials {
                username: ssh.username.clone(),
                password: SecretString::from(ssh.password.expose_secret().to_owned()),
            },
            keep_alive: ssh.keep_alive_interval,
            dial_backoff: ssh.dial_backoff,
            handshake_backoff: ssh.handshake_backoff,
            stream: None,
            session: None,
        };

        info!(name = %instance, port = ssh.port, timeout = ?ssh.timeout, "waiting for ssh");
        let deadline = tokio::time::sleep(ssh.timeout);
        tokio::pin!(deadline);

        let mut action = machine.start();
        loop {
            let event = tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => ConnectEvent::Cancel,
                () = &mut deadline => ConnectEvent::Timeout,
                event = dialer.perform(action) => event,
            };

            match &event {
                ConnectEvent::DialErr(error) => {
                    debug!(name = %instance, error = %error, "ssh not reachable yet");
                }
                ConnectEvent::HandshakeAuthErr(error) => warn!(
                    name = %instance,
                    attempt = machine.attempts() + 1,
                    budget = ssh.handshake_attempts,
                    error = %error,
                    "ssh authentication failed"
                ),
                _ => {}
            }

            match machine.on(event) {
                Next::Act(next) => {
                    debug!(name = %instance, action = %next, "ssh connect");
                    action = next;
                }
                Next::Connected => break,
                Next::Fail(err) => return Err(err),
            }
        }

        let session = dialer.session.take().ok_or_else(|| {
            BuildError::Handshake("handshake reported success without a session".to_owned())
        })?;
        info!(name = %instance, "ssh connected");
        ctx.outputs.shell.record(session)
    }
}
