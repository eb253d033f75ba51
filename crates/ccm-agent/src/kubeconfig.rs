//! Kubeconfig loading for running the agent outside a cluster
//!
//! Only the parts of the format the agent needs are read: the selected
//! context, its cluster (server, CA, TLS verification) and its user (bearer
//! token or client certificate). Relative file references are resolved
//! against the kubeconfig's directory.

use crate::{AgentError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default kubeconfig location relative to the home directory
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube").join("config"))
}

/// Parsed kubeconfig file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(default)]
    pub current_context: Option<String>,

    #[serde(default)]
    pub contexts: Vec<NamedContext>,

    #[serde(default)]
    pub clusters: Vec<NamedCluster>,

    #[serde(default)]
    pub users: Vec<NamedUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextEntry {
    pub cluster: String,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    pub server: String,

    #[serde(default)]
    pub certificate_authority: Option<PathBuf>,

    #[serde(default)]
    pub certificate_authority_data: Option<String>,

    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: UserEntry,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default, rename = "tokenFile")]
    pub token_file: Option<PathBuf>,

    #[serde(default)]
    pub client_certificate: Option<PathBuf>,

    #[serde(default)]
    pub client_certificate_data: Option<String>,

    #[serde(default)]
    pub client_key: Option<PathBuf>,

    #[serde(default)]
    pub client_key_data: Option<String>,
}

/// Connection settings resolved from one kubeconfig context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterAccess {
    pub server: String,
    pub ca_pem: Option<Vec<u8>>,
    pub insecure: bool,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    /// Client certificate followed by its private key, PEM encoded
    pub identity_pem: Option<Vec<u8>>,
}

impl Kubeconfig {
    /// Read and parse a kubeconfig file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("Failed to read kubeconfig {}: {}", path.display(), e))
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Resolve the current context, reading referenced files relative to
    /// `base_dir`
    pub fn resolve(&self, base_dir: &Path) -> Result<ClusterAccess> {
        let context_name = self
            .current_context
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AgentError::Config("kubeconfig has no current-context".to_string()))?;

        let context = self
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| {
                AgentError::Config(format!("kubeconfig context '{}' not found", context_name))
            })?;

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                AgentError::Config(format!("kubeconfig cluster '{}' not found", context.cluster))
            })?;

        let user = match context.user.as_deref() {
            Some(name) if !name.is_empty() => self
                .users
                .iter()
                .find(|u| u.name == name)
                .map(|u| u.user.clone())
                .ok_or_else(|| {
                    AgentError::Config(format!("kubeconfig user '{}' not found", name))
                })?,
            _ => UserEntry::default(),
        };

        let ca_pem = read_inline_or_file(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            base_dir,
        )?;

        let certificate = read_inline_or_file(
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
            base_dir,
        )?;
        let key = read_inline_or_file(
            user.client_key_data.as_deref(),
            user.client_key.as_deref(),
            base_dir,
        )?;
        let identity_pem = match (certificate, key) {
            (Some(mut certificate), Some(key)) => {
                if !certificate.ends_with(b"\n") {
                    certificate.push(b'\n');
                }
                certificate.extend_from_slice(&key);
                Some(certificate)
            }
            (None, None) => None,
            _ => {
                return Err(AgentError::Config(
                    "kubeconfig user needs both a client certificate and a client key".to_string(),
                ))
            }
        };

        Ok(ClusterAccess {
            server: cluster.server.trim_end_matches('/').to_string(),
            ca_pem,
            insecure: cluster.insecure_skip_tls_verify,
            token: user.token.filter(|t| !t.is_empty()),
            token_file: user.token_file.map(|p| base_dir.join(p)),
            identity_pem,
        })
    }
}

fn read_inline_or_file(
    data: Option<&str>,
    file: Option<&Path>,
    base_dir: &Path,
) -> Result<Option<Vec<u8>>> {
    if let Some(data) = data.filter(|d| !d.trim().is_empty()) {
        let decoded = BASE64_STANDARD
            .decode(data.trim())
            .map_err(|e| AgentError::Config(format!("Invalid base64 in kubeconfig: {}", e)))?;
        return Ok(Some(decoded));
    }

    match file {
        Some(file) => {
            let path = base_dir.join(file);
            std::fs::read(&path).map(Some).map_err(|e| {
                AgentError::Config(format!("Failed to read {}: {}", path.display(), e))
            })
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: lab
contexts:
- name: lab
  context:
    cluster: gpu-cluster
    user: cc-manager
- name: other
  context:
    cluster: missing
clusters:
- name: gpu-cluster
  cluster:
    server: https://10.0.0.1:6443/
    certificate-authority-data: Y2EtYnl0ZXM=
users:
- name: cc-manager
  user:
    token: secret-token
"#;

    #[test]
    fn test_resolve_current_context() {
        let config: Kubeconfig = serde_yaml::from_str(KUBECONFIG).unwrap();
        let access = config.resolve(Path::new("/nonexistent")).unwrap();

        assert_eq!(access.server, "https://10.0.0.1:6443");
        assert_eq!(access.ca_pem.as_deref(), Some(&b"ca-bytes"[..]));
        assert_eq!(access.token.as_deref(), Some("secret-token"));
        assert!(!access.insecure);
        assert!(access.identity_pem.is_none());
    }

    #[test]
    fn test_missing_cluster_is_an_error() {
        let mut config: Kubeconfig = serde_yaml::from_str(KUBECONFIG).unwrap();
        config.current_context = Some("other".to_string());
        assert!(matches!(
            config.resolve(Path::new("/")),
            Err(AgentError::Config(msg)) if msg.contains("missing")
        ));

        config.current_context = None;
        assert!(config.resolve(Path::new("/")).is_err());
    }

    #[test]
    fn test_relative_files_and_client_certificate() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ca.crt"), "CA").unwrap();
        std::fs::write(dir.path().join("client.crt"), "CERT").unwrap();
        std::fs::write(dir.path().join("client.key"), "KEY\n").unwrap();

        let path = dir.path().join("config");
        std::fs::write(
            &path,
            r#"
current-context: local
contexts:
- name: local
  context:
    cluster: kind
    user: admin
clusters:
- name: kind
  cluster:
    server: https://127.0.0.1:40000
    certificate-authority: ca.crt
    insecure-skip-tls-verify: true
users:
- name: admin
  user:
    client-certificate: client.crt
    client-key: client.key
    tokenFile: token
"#,
        )
        .unwrap();

        let access = Kubeconfig::load(&path).unwrap().resolve(dir.path()).unwrap();
        assert_eq!(access.ca_pem.as_deref(), Some(&b"CA"[..]));
        assert!(access.insecure);
        assert_eq!(access.identity_pem.as_deref(), Some(&b"CERT\nKEY\n"[..]));
        assert_eq!(access.token_file, Some(dir.path().join("token")));
    }

    #[test]
    fn test_certificate_without_key() {
        let config: Kubeconfig = serde_yaml::from_str(
            r#"
current-context: c
contexts: [{name: c, context: {cluster: k, user: u}}]
clusters: [{name: k, cluster: {server: "https://k"}}]
users: [{name: u, user: {client-certificate-data: Q0VSVA==}}]
"#,
        )
        .unwrap();
        assert!(config.resolve(Path::new("/")).is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Kubeconfig::load(&dir.path().join("absent")),
            Err(AgentError::Config(_))
        ));
    }
}
