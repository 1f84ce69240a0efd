//! Build configuration.
//!
//! Configuration is loaded in two stages. [`RawBuildConfig`] mirrors the TOML
//! file and is extracted with figment (file first, then `KUBEBAKE_`
//! environment variables). [`RawBuildConfig::validate`] applies defaults,
//! checks every field, and produces the immutable [`BuildConfig`] the
//! pipeline runs against.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use kubebake_cluster::types::DataVolumeSource;
use kubebake_cluster::Quantity;
use secrecy::SecretString;
use serde::Deserialize;

use crate::disk::{DataVolumeDisk, DeviceKind, DeviceSpec, DiskDescriptor};
use crate::error::{BuildError, BuildResult};

const ENV_PREFIX: &str = "KUBEBAKE_";

/// Configuration as written in the TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBuildConfig {
    /// Fixed name of the primary data volume.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Replace fixed-name data volumes left over from an earlier build.
    #[serde(default)]
    pub force: bool,

    #[serde(default = "default_cpu")]
    pub cpu: String,

    #[serde(default = "default_memory")]
    pub memory: String,

    #[serde(default)]
    pub efi: bool,

    /// Implies `efi`.
    #[serde(default)]
    pub secure_boot: bool,

    /// Hugepage size, e.g. `2Mi` or `1Gi`.
    #[serde(default)]
    pub hugepages_page_size: Option<String>,

    /// GPU device names, e.g. `nvidia.com/TU104GL_Tesla_T4`.
    #[serde(default)]
    pub gpus: Vec<String>,

    #[serde(default)]
    pub ssh: RawSshConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default, rename = "disk")]
    pub disks: Vec<RawDiskConfig>,

    #[serde(default)]
    pub provision: Vec<ProvisionConfig>,
}

fn default_namespace() -> String {
    "default".to_owned()
}

fn default_cpu() -> String {
    "4".to_owned()
}

fn default_memory() -> String {
    "4Gi".to_owned()
}

/// SSH settings as written. The password stays a plain string only until
/// validation wraps it.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSshConfig {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_ssh_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,

    #[serde(
        default = "default_keep_alive_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub keep_alive_interval: Duration,

    #[serde(default = "default_handshake_attempts")]
    pub handshake_attempts: u32,

    /// Wait between attempts to reach the instance's port.
    #[serde(default = "default_dial_backoff", deserialize_with = "deserialize_duration")]
    pub dial_backoff: Duration,

    /// Wait after a rejected handshake.
    #[serde(
        default = "default_handshake_backoff",
        deserialize_with = "deserialize_duration"
    )]
    pub handshake_backoff: Duration,
}

impl Default for RawSshConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            port: default_ssh_port(),
            timeout: default_ssh_timeout(),
            keep_alive_interval: default_keep_alive_interval(),
            handshake_attempts: default_handshake_attempts(),
            dial_backoff: default_dial_backoff(),
            handshake_backoff: default_handshake_backoff(),
        }
    }
}

impl std::fmt::Debug for RawSshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSshConfig")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_handshake_attempts() -> u32 {
    10
}

fn default_dial_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_handshake_backoff() -> Duration {
    Duration::from_secs(2)
}

/// Where to find the API server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Kubeconfig path. Falls back to `KUBECONFIG`, `~/.kube/config`, then
    /// the in-cluster service account.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Context to use instead of the kubeconfig's current context.
    #[serde(default)]
    pub context: Option<String>,
}

/// One `[[disk]]` entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDiskConfig {
    /// `datavolume`, `containerdisk`, `cloudinit` or `sysprep`.
    #[serde(rename = "type")]
    pub disk_type: String,

    /// `disk` (default) or `cdrom`.
    #[serde(default)]
    pub device: Option<String>,

    #[serde(default)]
    pub boot_order: u32,

    /// Fixed data volume name. Named data volumes are kept after the build.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub size: Option<String>,

    #[serde(default)]
    pub volume_mode: Option<String>,

    #[serde(default)]
    pub storage_class_name: Option<String>,

    #[serde(default)]
    pub preallocation: bool,

    #[serde(default)]
    pub source: Option<RawSourceConfig>,

    /// Container image for `containerdisk`.
    #[serde(default)]
    pub image: Option<String>,

    /// File name to contents, for `cloudinit` and `sysprep`.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSourceConfig {
    /// `http`, `registry` or `blank`.
    #[serde(rename = "type")]
    pub source_type: String,

    #[serde(default)]
    pub url: Option<String>,
}

/// One `[[provision]]` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Commands run in order over SSH.
    #[serde(default)]
    pub inline: Vec<String>,
}

/// Validated SSH settings.
#[derive(Debug)]
pub struct SshConfig {
    pub username: String,
    pub password: SecretString,
    pub port: u16,
    pub timeout: Duration,
    pub keep_alive_interval: Duration,
    pub handshake_attempts: u32,
    pub dial_backoff: Duration,
    pub handshake_backoff: Duration,
}

/// Validated build configuration.
#[derive(Debug)]
pub struct BuildConfig {
    pub namespace: String,
    pub force: bool,
    pub cpu: Quantity,
    pub memory: Quantity,
    pub efi: bool,
    pub secure_boot: bool,
    pub hugepages_page_size: Option<String>,
    pub gpus: Vec<String>,
    pub ssh: SshConfig,
    pub cluster: ClusterConfig,
    /// The first entry is the primary data volume.
    pub disks: Vec<DiskDescriptor>,
    pub provision: Vec<ProvisionConfig>,
}

impl BuildConfig {
    /// Load and validate configuration from a TOML file and the environment.
    pub fn from_file(path: impl AsRef<Path>) -> BuildResult<Self> {
        RawBuildConfig::from_file(path)?.validate()
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> BuildResult<Self> {
        RawBuildConfig::parse(content)?.validate()
    }

    /// Data volume descriptors in configuration order.
    pub fn data_volumes(&self) -> impl Iterator<Item = (usize, &DataVolumeDisk)> {
        self.disks.iter().filter_map(|d| match d {
            DiskDescriptor::DataVolume { index, volume, .. } => Some((*index, volume)),
            _ => None,
        })
    }

    /// The data volume disk with the given index.
    pub fn data_volume(&self, index: usize) -> BuildResult<&DataVolumeDisk> {
        self.data_volumes()
            .find(|(i, _)| *i == index)
            .map(|(_, volume)| volume)
            .ok_or_else(|| BuildError::config(format!("no data volume disk with index {index}")))
    }

    /// Files for the cloud-init disk with the given index.
    pub fn cloud_init_files(&self, index: usize) -> BuildResult<&BTreeMap<String, String>> {
        self.disks
            .iter()
            .find_map(|d| match d {
                DiskDescriptor::CloudInit { index: i, files, .. } if *i == index => Some(files),
                _ => None,
            })
            .ok_or_else(|| BuildError::config(format!("no cloudinit disk with index {index}")))
    }

    /// Files for the sysprep disk with the given index.
    pub fn sysprep_files(&self, index: usize) -> BuildResult<&BTreeMap<String, String>> {
        self.disks
            .iter()
            .find_map(|d| match d {
                DiskDescriptor::Sysprep { index: i, files, .. } if *i == index => Some(files),
                _ => None,
            })
            .ok_or_else(|| BuildError::config(format!("no sysprep disk with index {index}")))
    }

    /// Data volumes with a fixed name.
    pub fn fixed_volume_names(&self) -> impl Iterator<Item = &str> {
        self.data_volumes()
            .filter_map(|(_, volume)| volume.name.as_deref())
    }
}

impl RawBuildConfig {
    pub fn from_file(path: impl AsRef<Path>) -> BuildResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BuildError::config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| BuildError::config(e.to_string()))
    }

    pub fn parse(content: &str) -> BuildResult<Self> {
        Figment::new()
            .merge(Toml::string(content))
            .extract()
            .map_err(|e| BuildError::config(e.to_string()))
    }

    /// Check every field, collecting all problems into one error.
    pub fn validate(self) -> BuildResult<BuildConfig> {
        let mut problems = Vec::new();

        if self.namespace.is_empty() {
            problems.push("namespace must not be empty".to_owned());
        }
        if self.ssh.username.is_empty() {
            problems.push("ssh.username must be specified".to_owned());
        }
        if self.ssh.password.is_empty() {
            problems.push("ssh.password must be specified".to_owned());
        }
        if self.ssh.port == 0 {
            problems.push("ssh.port must be positive".to_owned());
        }
        if self.ssh.handshake_attempts == 0 {
            problems.push("ssh.handshake_attempts must be positive".to_owned());
        }
        for (field, value) in [
            ("ssh.timeout", self.ssh.timeout),
            ("ssh.keep_alive_interval", self.ssh.keep_alive_interval),
        ] {
            if value.is_zero() {
                problems.push(format!("{field} must be positive"));
            }
        }

        let cpu = quantity("cpu", &self.cpu, &mut problems);
        let memory = quantity("memory", &self.memory, &mut problems);

        if self.disks.is_empty() {
            problems.push("at least one disk must be specified".to_owned());
        } else if self.disks[0].disk_type != "datavolume" {
            problems.push("the first disk must be of type datavolume".to_owned());
        }
        if let (Some(_), Some(first)) = (&self.name, self.disks.first()) {
            if first.disk_type == "datavolume" && first.name.is_some() {
                problems.push(
                    "name conflicts with the name of the first disk; set only one".to_owned(),
                );
            }
        }

        let mut counters = [0usize; 4];
        let mut disks = Vec::with_capacity(self.disks.len());
        for (position, raw) in self.disks.into_iter().enumerate() {
            if let Some(disk) = descriptor(position, raw, &mut counters, &mut problems) {
                disks.push(disk);
            }
        }

        // The top-level name belongs to the primary volume.
        if let (Some(name), Some(DiskDescriptor::DataVolume { index: 0, volume, .. })) =
            (self.name, disks.first_mut())
        {
            if volume.name.is_none() {
                volume.name = Some(name);
            }
        }

        let (Some(cpu), Some(memory)) = (cpu, memory) else {
            return Err(BuildError::Config { problems });
        };
        if !problems.is_empty() {
            return Err(BuildError::Config { problems });
        }

        Ok(BuildConfig {
            namespace: self.namespace,
            force: self.force,
            cpu,
            memory,
            efi: self.efi || self.secure_boot,
            secure_boot: self.secure_boot,
            hugepages_page_size: self.hugepages_page_size,
            gpus: self.gpus,
            ssh: SshConfig {
                username: self.ssh.username,
                password: SecretString::from(self.ssh.password),
                port: self.ssh.port,
                timeout: self.ssh.timeout,
                keep_alive_interval: self.ssh.keep_alive_interval,
                handshake_attempts: self.ssh.handshake_attempts,
                dial_backoff: self.ssh.dial_backoff,
                handshake_backoff: self.ssh.handshake_backoff,
            },
            cluster: self.cluster,
            disks,
            provision: self.provision,
        })
    }
}

fn quantity(field: &str, value: &str, problems: &mut Vec<String>) -> Option<Quantity> {
    match Quantity::parse(value) {
        Ok(q) => Some(q),
        Err(source) => {
            problems.push(
                BuildError::InvalidQuantity {
                    field: field.to_owned(),
                    source,
                }
                .to_string(),
            );
            None
        }
    }
}

/// Parse a data volume source.
pub fn parse_source(source_type: &str, url: Option<&str>) -> BuildResult<DataVolumeSource> {
    let url = || {
        url.filter(|u| !u.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| BuildError::config(format!("source type {source_type} needs a url")))
    };
    match source_type {
        "http" => Ok(DataVolumeSource::Http { url: url()? }),
        "registry" => Ok(DataVolumeSource::Registry { url: url()? }),
        "blank" => Ok(DataVolumeSource::Blank {}),
        other => Err(BuildError::UnknownSourceType(other.to_owned())),
    }
}

fn descriptor(
    position: usize,
    raw: RawDiskConfig,
    counters: &mut [usize; 4],
    problems: &mut Vec<String>,
) -> Option<DiskDescriptor> {
    let before = problems.len();
    let field = |name: &str| format!("disk[{position}].{name}");

    let kind = match raw.device.as_deref() {
        None | Some("disk") => DeviceKind::Disk,
        Some("cdrom") => DeviceKind::Cdrom,
        Some(other) => {
            problems.push(format!("{}: unknown device {other:?}", field("device")));
            DeviceKind::Disk
        }
    };
    let device = DeviceSpec {
        kind,
        boot_order: raw.boot_order,
    };

    let mut next_index = |slot: usize| {
        let index = counters[slot];
        counters[slot] += 1;
        index
    };

    let descriptor = match raw.disk_type.as_str() {
        "datavolume" => {
            let size = match raw.size.as_deref() {
                Some(size) => quantity(&field("size"), size, problems),
                None => {
                    problems.push(format!("{} must be specified", field("size")));
                    None
                }
            };
            let source = match &raw.source {
                Some(source) => match parse_source(&source.source_type, source.url.as_deref()) {
                    Ok(source) => Some(source),
                    Err(e) => {
                        problems.push(format!("{}: {e}", field("source")));
                        None
                    }
                },
                None => {
                    problems.push(format!("{} must be specified", field("source")));
                    None
                }
            };
            let (Some(size), Some(source)) = (size, source) else {
                return None;
            };
            DiskDescriptor::DataVolume {
                index: next_index(0),
                volume: DataVolumeDisk {
                    name: raw.name.filter(|n| !n.is_empty()),
                    size,
                    volume_mode: raw.volume_mode.filter(|m| !m.is_empty()),
                    storage_class_name: raw.storage_class_name.filter(|s| !s.is_empty()),
                    preallocation: raw.preallocation,
                    source,
                },
                device,
            }
        }
        "containerdisk" => match raw.image.filter(|i| !i.is_empty()) {
            Some(image) => DiskDescriptor::ContainerImage {
                index: next_index(1),
                image,
                device,
            },
            None => {
                problems.push(format!("{} must be specified", field("image")));
                return None;
            }
        },
        "cloudinit" | "sysprep" if raw.files.is_empty() => {
            problems.push(format!("{} must not be empty", field("files")));
            return None;
        }
        "cloudinit" => DiskDescriptor::CloudInit {
            index: next_index(2),
            files: raw.files,
            device,
        },
        "sysprep" => DiskDescriptor::Sysprep {
            index: next_index(3),
            files: raw.files,
            device,
        },
        other => {
            problems.push(format!("{}: unknown disk type {other:?}", field("type")));
            return None;
        }
    };

    (problems.len() == before).then_some(descriptor)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let number = |digits: &str| -> Result<u64, String> {
        digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))
    };
    let scaled = |value: u64, unit: u64| -> Result<Duration, String> {
        value
            .checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("invalid duration: {s}"))
    };

    if let Some(ms) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(number(ms)?))
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(Duration::from_secs(number(secs)?))
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled(number(mins)?, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled(number(hours)?, 60 * 60)
    } else {
        Ok(Duration::from_secs(number(s)?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rstest::rstest;
    use secrecy::ExposeSecret;

    const MINIMAL: &str = r#"
        [ssh]
        username = "fedora"
        password = "hunter2"

        [[disk]]
        type = "datavolume"
        size = "10Gi"
        source = { type = "blank" }
    "#;

    #[rstest]
    #[case("100ms", Duration::from_millis(100))]
    #[case("5s", Duration::from_secs(5))]
    #[case("10m", Duration::from_secs(600))]
    #[case("1h", Duration::from_secs(3600))]
    #[case("60", Duration::from_secs(60))]
    fn durations(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[test]
    fn invalid_duration() {
        assert!(parse_duration("soon").is_err());
    }

    #[rstest]
    #[case("9999999999999999h")]
    #[case("999999999999999999m")]
    fn overflowing_duration_is_an_error(#[case] input: &str) {
        assert!(parse_duration(input).is_err());
    }

    #[test]
    fn overflowing_ssh_timeout_is_a_configuration_error() {
        let content = MINIMAL.replace(
            r#"password = "hunter2""#,
            "password = \"hunter2\"\ntimeout = \"9999999999999999h\"",
        );

        let err = BuildConfig::parse(&content).unwrap_err();
        assert!(err.is_configuration(), "{err}");
    }

    #[test]
    fn defaults_apply() {
        let config = BuildConfig::parse(MINIMAL).unwrap();

        assert_eq!(config.namespace, "default");
        assert_eq!(config.cpu.as_str(), "4");
        assert_eq!(config.memory.as_str(), "4Gi");
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.ssh.timeout, Duration::from_secs(3600));
        assert_eq!(config.ssh.keep_alive_interval, Duration::from_secs(5));
        assert_eq!(config.ssh.handshake_attempts, 10);
        assert_eq!(config.ssh.password.expose_secret(), "hunter2");
        assert!(!config.efi);
        assert!(!config.force);
    }

    #[test]
    fn secure_boot_implies_efi() {
        let content = format!("secure_boot = true\n{MINIMAL}");
        let config = BuildConfig::parse(&content).unwrap();
        assert!(config.efi);
        assert!(config.secure_boot);
    }

    #[test]
    fn every_problem_is_reported() {
        let content = r#"
            cpu = "lots"

            [[disk]]
            type = "cloudinit"
        "#;
        let Err(BuildError::Config { problems }) = BuildConfig::parse(content) else {
            panic!("expected a configuration error");
        };

        let joined = problems.join("\n");
        assert!(joined.contains("ssh.username"), "{joined}");
        assert!(joined.contains("ssh.password"), "{joined}");
        assert!(joined.contains("cpu"), "{joined}");
        assert!(joined.contains("first disk"), "{joined}");
        assert!(joined.contains("disk[0].files"), "{joined}");
    }

    #[test]
    fn unknown_source_type_is_a_configuration_error() {
        let content = MINIMAL.replace("\"blank\"", "\"ftp\"");
        let err = BuildConfig::parse(&content).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("unknown data volume source type"));
    }

    #[test]
    fn http_source_needs_url() {
        assert!(parse_source("http", None).is_err());
        assert_eq!(
            parse_source("registry", Some("docker://quay.io/fedora")).unwrap(),
            DataVolumeSource::Registry {
                url: "docker://quay.io/fedora".to_owned()
            }
        );
    }

    #[test]
    fn indices_count_per_kind() {
        let content = format!(
            r#"{MINIMAL}
            [[disk]]
            type = "cloudinit"
            device = "cdrom"
            files = {{ "user-data" = "x" }}

            [[disk]]
            type = "datavolume"
            name = "scratch-keep"
            size = "1Gi"
            source = {{ type = "blank" }}

            [[disk]]
            type = "cloudinit"
            files = {{ "meta-data" = "y" }}
            "#
        );
        let config = BuildConfig::parse(&content).unwrap();
        let names: Vec<String> = config.disks.iter().map(DiskDescriptor::name).collect();

        assert_eq!(
            names,
            vec!["datavolume-0", "cloudinit-0", "datavolume-1", "cloudinit-1"]
        );
        assert_eq!(config.fixed_volume_names().collect::<Vec<_>>(), vec!["scratch-keep"]);
    }

    #[test]
    fn top_level_name_goes_to_primary() {
        let content = format!("name = \"golden\"\n{MINIMAL}");
        let config = BuildConfig::parse(&content).unwrap();
        assert_eq!(config.fixed_volume_names().collect::<Vec<_>>(), vec!["golden"]);
    }

    #[test]
    fn conflicting_names_are_rejected() {
        let content = format!("name = \"golden\"\n{MINIMAL}").replace(
            "type = \"datavolume\"",
            "type = \"datavolume\"\n        name = \"other\"",
        );
        let err = BuildConfig::parse(&content).unwrap_err();
        assert!(err.to_string().contains("conflicts"));
    }

    #[test]
    fn environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("build.toml", MINIMAL)?;
            jail.set_env("KUBEBAKE_NAMESPACE", "images");
            jail.set_env("KUBEBAKE_SSH__PASSWORD", "from-env");

            let config = BuildConfig::from_file("build.toml").unwrap();
            assert_eq!(config.namespace, "images");
            assert_eq!(config.ssh.password.expose_secret(), "from-env");
            Ok(())
        });
    }
}
