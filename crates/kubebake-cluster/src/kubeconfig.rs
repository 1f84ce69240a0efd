//! Locating API server credentials.
//!
//! Lookup order for [`ClusterConnection::infer`]:
//!
//! 1. An explicit kubeconfig path
//! 2. The first entry of `KUBECONFIG`
//! 3. `~/.kube/config`
//! 4. The in-cluster service account

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::SecretString;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ClusterError, Result};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// PEM-encoded client certificate and PKCS#8 key.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub certificate_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Everything needed to talk to an API server.
#[derive(Debug)]
pub struct ClusterConnection {
    pub server: String,
    pub token: Option<SecretString>,
    /// PEM bundle of trusted roots, in addition to the system store.
    pub certificate_authority: Option<Vec<u8>>,
    pub client_identity: Option<ClientIdentity>,
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeConfig {
    #[serde(default)]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "tokenFile")]
    token_file: Option<PathBuf>,
    #[serde(default)]
    client_certificate: Option<PathBuf>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key: Option<PathBuf>,
    #[serde(default)]
    client_key_data: Option<String>,
}

fn config_error(message: impl Into<String>) -> ClusterError {
    ClusterError::KubeConfig(message.into())
}

fn decode_data(field: &str, data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| config_error(format!("{field}: {e}")))
}

fn read_relative(base: &Path, path: &Path) -> Result<Vec<u8>> {
    let full = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    std::fs::read(&full).map_err(|e| config_error(format!("{}: {e}", full.display())))
}

/// Inline data wins over a file reference, matching kubectl.
fn load_material(
    base: &Path,
    field: &str,
    data: Option<&str>,
    file: Option<&Path>,
) -> Result<Option<Vec<u8>>> {
    match (data, file) {
        (Some(data), _) => decode_data(field, data).map(Some),
        (None, Some(file)) => read_relative(base, file).map(Some),
        (None, None) => Ok(None),
    }
}

impl ClusterConnection {
    /// Find connection settings using the standard lookup order.
    ///
    /// `context` overrides the kubeconfig's `current-context`.
    pub fn infer(explicit: Option<&Path>, context: Option<&str>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_kubeconfig(path, context);
        }

        if let Some(paths) = std::env::var_os("KUBECONFIG") {
            if let Some(first) = std::env::split_paths(&paths).find(|p| !p.as_os_str().is_empty())
            {
                return Self::from_kubeconfig(&first, context);
            }
        }

        if let Some(home) = std::env::var_os("HOME") {
            let default = Path::new(&home).join(".kube").join("config");
            if default.is_file() {
                return Self::from_kubeconfig(&default, context);
            }
        }

        if std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() {
            return Self::in_cluster(Path::new(SERVICE_ACCOUNT_DIR));
        }

        Err(config_error(
            "no kubeconfig found and not running inside a cluster",
        ))
    }

    /// Load a context of a kubeconfig file, the current one by default.
    pub fn from_kubeconfig(path: &Path, context: Option<&str>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("{}: {e}", path.display())))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        debug!(path = %path.display(), "loading kubeconfig");
        Self::parse_kubeconfig(&contents, base, context)
    }

    /// Parse kubeconfig YAML. Relative file references resolve against `base`.
    pub fn parse_kubeconfig(yaml: &str, base: &Path, context: Option<&str>) -> Result<Self> {
        let config: KubeConfig =
            serde_yaml::from_str(yaml).map_err(|e| config_error(e.to_string()))?;

        let context_name = context
            .or(config.current_context.as_deref())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| config_error("current-context is not set"))?;
        let context = config
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| config_error(format!("context {context_name:?} not found")))?;
        let cluster = config
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| config_error(format!("cluster {:?} not found", context.cluster)))?;
        let user = match &context.user {
            Some(name) => Some(
                config
                    .users
                    .iter()
                    .find(|u| &u.name == name)
                    .map(|u| &u.user)
                    .ok_or_else(|| config_error(format!("user {name:?} not found")))?,
            ),
            None => None,
        };

        let certificate_authority = load_material(
            base,
            "certificate-authority-data",
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
        )?;

        let mut token = None;
        let mut client_identity = None;
        if let Some(user) = user {
            token = match (&user.token, &user.token_file) {
                (Some(token), _) => Some(token.clone()),
                (None, Some(file)) => {
                    let raw = read_relative(base, file)?;
                    Some(String::from_utf8_lossy(&raw).trim().to_owned())
                }
                (None, None) => None,
            };

            let certificate = load_material(
                base,
                "client-certificate-data",
                user.client_certificate_data.as_deref(),
                user.client_certificate.as_deref(),
            )?;
            let key = load_material(
                base,
                "client-key-data",
                user.client_key_data.as_deref(),
                user.client_key.as_deref(),
            )?;
            client_identity = match (certificate, key) {
                (Some(certificate_pem), Some(key_pem)) => Some(ClientIdentity {
                    certificate_pem,
                    key_pem,
                }),
                (None, None) => None,
                _ => {
                    return Err(config_error(
                        "client certificate and key must be given together",
                    ))
                }
            };
        }

        Ok(Self {
            server: cluster.server.clone(),
            token: token.map(SecretString::from),
            certificate_authority,
            client_identity,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
        })
    }

    /// Use the service account mounted into a pod.
    pub fn in_cluster(account_dir: &Path) -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| config_error("KUBERNETES_SERVICE_HOST is not set"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_owned());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let token = read_relative(account_dir, Path::new("token"))?;
        let ca = read_relative(account_dir, Path::new("ca.crt"))?;

        Ok(Self {
            server: format!("https://{host}:{port}"),
            token: Some(SecretString::from(
                String::from_utf8_lossy(&token).trim().to_owned(),
            )),
            certificate_authority: Some(ca),
            client_identity: None,
            insecure_skip_tls_verify: false,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: lab
clusters:
  - name: lab-cluster
    cluster:
      server: https://10.0.0.1:6443
      certificate-authority-data: Q0EgUEVN
  - name: other
    cluster:
      server: https://other:6443
contexts:
  - name: lab
    context:
      cluster: lab-cluster
      user: builder
  - name: elsewhere
    context:
      cluster: other
users:
  - name: builder
    user:
      tokenFile: token
"#;

    #[test]
    fn current_context_selects_cluster_and_user() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "abc123\n").unwrap();

        let conn = ClusterConnection::parse_kubeconfig(KUBECONFIG, dir.path(), None).unwrap();

        assert_eq!(conn.server, "https://10.0.0.1:6443");
        assert_eq!(conn.certificate_authority.as_deref(), Some(&b"CA PEM"[..]));
        assert_eq!(conn.token.unwrap().expose_secret(), "abc123");
        assert!(conn.client_identity.is_none());
        assert!(!conn.insecure_skip_tls_verify);
    }

    #[test]
    fn missing_context_is_an_error() {
        let yaml = KUBECONFIG.replace("current-context: lab", "current-context: nowhere");
        let err = ClusterConnection::parse_kubeconfig(&yaml, Path::new("."), None).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn context_without_user_has_no_credentials() {
        let conn =
            ClusterConnection::parse_kubeconfig(KUBECONFIG, Path::new("."), Some("elsewhere"))
                .unwrap();
        assert_eq!(conn.server, "https://other:6443");
        assert!(conn.token.is_none());
        assert!(conn.certificate_authority.is_none());
    }

    #[test]
    fn half_a_client_identity_is_rejected() {
        let yaml = KUBECONFIG.replace(
            "tokenFile: token",
            "client-certificate-data: Q0VSVA==",
        );
        assert!(ClusterConnection::parse_kubeconfig(&yaml, Path::new("."), None).is_err());
    }

    #[test]
    fn from_kubeconfig_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "from-file").unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, KUBECONFIG).unwrap();

        let conn = ClusterConnection::from_kubeconfig(&path, None).unwrap();
        assert_eq!(conn.token.unwrap().expose_secret(), "from-file");
    }
}
