//! Common test utilities for builder integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kubebake_builder::{
    BuildConfig, Builder, CommandOutput, HandshakeError, SessionError, ShellConnector,
    ShellCredentials, ShellSession,
};
use kubebake_cluster::{MemoryCluster, PortStream};

/// Outcome of one scripted handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Accept,
    RejectAuth,
    DropConnection,
    ProtocolError,
}

#[derive(Default)]
struct ConnectorState {
    script: VecDeque<Handshake>,
    handshakes: usize,
    usernames: Vec<String>,
    commands: Vec<String>,
    exit_statuses: HashMap<String, u32>,
    closed: usize,
}

/// Shell connector whose handshakes follow a script. Unscripted handshakes
/// succeed. Sessions record every command and exit 0 unless told otherwise.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = Handshake>) {
        self.state.lock().unwrap().script.extend(outcomes);
    }

    /// Make `command` exit with `status`.
    pub fn exit_status(&self, command: &str, status: u32) {
        self.state
            .lock()
            .unwrap()
            .exit_statuses
            .insert(command.to_owned(), status);
    }

    pub fn handshakes(&self) -> usize {
        self.state.lock().unwrap().handshakes
    }

    pub fn usernames(&self) -> Vec<String> {
        self.state.lock().unwrap().usernames.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn closed_sessions(&self) -> usize {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl ShellConnector for ScriptedConnector {
    async fn handshake(
        &self,
        _stream: PortStream,
        credentials: &ShellCredentials,
        _keep_alive: Duration,
    ) -> Result<Box<dyn ShellSession>, HandshakeError> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.handshakes += 1;
            state.usernames.push(credentials.username.clone());
            state.script.pop_front().unwrap_or(Handshake::Accept)
        };

        match outcome {
            Handshake::Accept => Ok(Box::new(ScriptedSession {
                state: Arc::clone(&self.state),
            })),
            Handshake::RejectAuth => Err(HandshakeError::Authentication("password rejected".into())),
            Handshake::DropConnection => Err(HandshakeError::Connection("connection reset".into())),
            Handshake::ProtocolError => Err(HandshakeError::Protocol("no common cipher".into())),
        }
    }
}

struct ScriptedSession {
    state: Arc<Mutex<ConnectorState>>,
}

#[async_trait]
impl ShellSession for ScriptedSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SessionError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_owned());
        let exit_status = state.exit_statuses.get(command).copied().unwrap_or(0);
        Ok(CommandOutput {
            exit_status,
            stdout: Vec::new(),
            stderr: if exit_status == 0 {
                Vec::new()
            } else {
                b"command failed".to_vec()
            },
        })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.state.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// A builder wired to a memory cluster and a scripted connector.
pub struct TestBuild {
    pub cluster: Arc<MemoryCluster>,
    pub connector: ScriptedConnector,
    pub builder: Builder,
}

impl TestBuild {
    pub fn new(config: &str) -> Self {
        Self::with_cluster(config, MemoryCluster::new())
    }

    pub fn with_cluster(config: &str, cluster: MemoryCluster) -> Self {
        let cluster = Arc::new(cluster);
        let connector = ScriptedConnector::new();
        let builder = Builder::new(
            BuildConfig::parse(config).unwrap(),
            cluster.clone(),
            Arc::new(connector.clone()),
        );
        Self {
            cluster,
            connector,
            builder,
        }
    }
}

/// Namespace used by every fixture.
pub const NAMESPACE: &str = "images";

/// SSH settings shared by the fixtures. Short backoffs keep paused-clock
/// tests readable.
pub const SSH: &str = r#"
    [ssh]
    username = "fedora"
    password = "s3cret"
    timeout = "10m"
    handshake_attempts = 3
    dial_backoff = "5s"
    handshake_backoff = "2s"
"#;

/// One blank primary volume and a single shutdown command.
pub fn minimal_config() -> String {
    format!(
        r#"
        namespace = "{NAMESPACE}"
        {SSH}

        [[disk]]
        type = "datavolume"
        size = "10Gi"
        source = {{ type = "blank" }}

        [[provision]]
        inline = ["poweroff"]
        "#
    )
}

/// Every disk kind: a named primary, a scratch volume, a named extra volume,
/// a container disk and a cloud-init disk with two files.
pub fn full_config() -> String {
    format!(
        r##"
        name = "fedora-40"
        namespace = "{NAMESPACE}"
        efi = true
        {SSH}

        [[disk]]
        type = "datavolume"
        size = "20Gi"
        boot_order = 1
        source = {{ type = "http", url = "https://example.com/fedora.qcow2" }}

        [[disk]]
        type = "datavolume"
        size = "5Gi"
        source = {{ type = "blank" }}

        [[disk]]
        type = "datavolume"
        name = "data"
        size = "1Gi"
        source = {{ type = "blank" }}

        [[disk]]
        type = "containerdisk"
        image = "quay.io/containerdisks/virtio-win:latest"
        device = "cdrom"

        [[disk]]
        type = "cloudinit"
        files = {{ "user-data" = "#cloud-config\npassword: s3cret", "meta-data" = "instance-id: bake" }}

        [[provision]]
        inline = ["dnf -y update", "poweroff"]
        "##
    )
}
