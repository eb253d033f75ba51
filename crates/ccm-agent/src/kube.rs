//! Kubernetes API client for the node metadata capability
//!
//! Only the handful of REST calls the agent needs are implemented: reading
//! and merge-patching the node object, listing operator pods on the node and
//! watching the node for label changes.

use crate::config::AgentConfig;
use crate::kubeconfig::{default_kubeconfig_path, Kubeconfig};
use crate::{AgentError, Result};
use async_trait::async_trait;
use ccm_core::{Error as CoreError, NodeEvent, NodeMetadata, NodeSnapshot};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Mount point of the pod's service account credentials
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Server-side lifetime of a single watch request
pub const WATCH_TIMEOUT_SECONDS: u64 = 300;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MERGE_PATCH: &str = "application/merge-patch+json";

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,

    #[serde(default, rename = "resourceVersion")]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeObject {
    metadata: ObjectMeta,
}

impl From<NodeObject> for NodeSnapshot {
    fn from(node: NodeObject) -> Self {
        NodeSnapshot {
            labels: node.metadata.labels.unwrap_or_default(),
            resource_version: node.metadata.resource_version,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct Status {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone)]
enum BearerToken {
    None,
    Static(String),
    // Bound service account tokens rotate, so the file is read per request
    File(PathBuf),
}

/// REST client bound to a single node
#[derive(Debug, Clone)]
pub struct KubeClient {
    client: Client,
    base_url: String,
    node_name: String,
    token: BearerToken,
}

impl KubeClient {
    /// Create a client for an explicit API server URL without credentials,
    /// e.g. a local `kubectl proxy`
    pub fn new(base_url: &str, node_name: impl Into<String>) -> Result<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            node_name: node_name.into(),
            token: BearerToken::None,
        })
    }

    /// Create a client from the pod's service account
    pub fn in_cluster(node_name: impl Into<String>) -> Result<Self> {
        Self::in_cluster_from(Path::new(SERVICE_ACCOUNT_DIR), node_name)
    }

    fn in_cluster_from(account_dir: &Path, node_name: impl Into<String>) -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            AgentError::Config(
                "KUBERNETES_SERVICE_HOST is not set; set KUBECONFIG or KUBE_API_SERVER when running outside a cluster"
                    .to_string(),
            )
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let ca_path = account_dir.join("ca.crt");
        let ca = std::fs::read(&ca_path).map_err(|e| {
            AgentError::Config(format!("Failed to read {}: {}", ca_path.display(), e))
        })?;
        let certificate = reqwest::Certificate::from_pem(&ca)?;

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .add_root_certificate(certificate)
            .build()?;

        // IPv6 service hosts need brackets in the authority
        let authority = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        Ok(Self {
            client,
            base_url: format!("https://{}", authority),
            node_name: node_name.into(),
            token: BearerToken::File(account_dir.join("token")),
        })
    }

    /// Create a client from the current context of a kubeconfig file
    pub fn from_kubeconfig(path: &Path, node_name: impl Into<String>) -> Result<Self> {
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let access = Kubeconfig::load(path)?.resolve(base_dir)?;

        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(ca) = &access.ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(ca)?);
        }
        if access.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(identity) = &access.identity_pem {
            builder = builder.identity(reqwest::Identity::from_pem(identity)?);
        }

        let token = match (access.token, access.token_file) {
            (Some(token), _) => BearerToken::Static(token),
            (None, Some(path)) => BearerToken::File(path),
            (None, None) => BearerToken::None,
        };

        Ok(Self {
            client: builder.build()?,
            base_url: access.server,
            node_name: node_name.into(),
            token,
        })
    }

    /// Create a client as selected by the agent configuration
    ///
    /// An explicit API server URL wins over a kubeconfig file, which wins over
    /// the pod's service account. Outside a cluster with neither configured,
    /// `~/.kube/config` is used when present.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        if let Some(url) = config.kube_api_server.as_deref().filter(|u| !u.trim().is_empty()) {
            info!("Using Kubernetes API server at {}", url);
            return Self::new(url, config.node_name.clone());
        }

        if let Some(path) = config.kubeconfig_path() {
            info!("Using kubeconfig {}", path.display());
            return Self::from_kubeconfig(path, config.node_name.clone());
        }

        if std::env::var_os("KUBERNETES_SERVICE_HOST").is_none() {
            if let Some(path) = default_kubeconfig_path().filter(|p| p.is_file()) {
                info!("Not running in a cluster, using kubeconfig {}", path.display());
                return Self::from_kubeconfig(&path, config.node_name.clone());
            }
        }

        info!("Using in-cluster Kubernetes configuration");
        Self::in_cluster(config.node_name.clone())
    }

    /// Base URL of the API server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn node_url(&self) -> String {
        format!("{}/api/v1/nodes/{}", self.base_url, self.node_name)
    }

    async fn authorize(&self, request: RequestBuilder) -> ccm_core::Result<RequestBuilder> {
        match &self.token {
            BearerToken::Static(token) => Ok(request.bearer_auth(token)),
            BearerToken::File(path) => {
                let token = tokio::fs::read_to_string(path).await?;
                Ok(request.bearer_auth(token.trim()))
            }
            BearerToken::None => Ok(request),
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> ccm_core::Result<Response> {
        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| CoreError::api(format!("{} request failed: {}", what, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::GONE {
            return Err(CoreError::Gone(format!("{}: {}", what, body.trim())));
        }
        Err(CoreError::api(format!("{} failed with {}: {}", what, status, body.trim())))
    }
}

/// Decode one line of a watch response body
///
/// Blank lines and event types the agent has no use for decode to `None`.
pub fn decode_watch_line(line: &str) -> ccm_core::Result<Option<NodeEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let event: WatchEvent = serde_json::from_str(line)?;
    let event = match event.event_type.as_str() {
        "ADDED" => NodeEvent::Added(serde_json::from_value::<NodeObject>(event.object)?.into()),
        "MODIFIED" => {
            NodeEvent::Modified(serde_json::from_value::<NodeObject>(event.object)?.into())
        }
        "DELETED" => NodeEvent::Deleted(serde_json::from_value::<NodeObject>(event.object)?.into()),
        "BOOKMARK" => {
            let node: NodeObject = serde_json::from_value(event.object)?;
            NodeEvent::Bookmark {
                resource_version: node.metadata.resource_version.unwrap_or_default(),
            }
        }
        "ERROR" => {
            let status: Status = serde_json::from_value(event.object).unwrap_or_default();
            NodeEvent::Error {
                code: status.code,
                message: status.message,
            }
        }
        other => {
            debug!("Ignoring watch event of type {}", other);
            return Ok(None);
        }
    };
    Ok(Some(event))
}

#[async_trait]
impl NodeMetadata for KubeClient {
    fn node_name(&self) -> &str {
        &self.node_name
    }

    async fn get_node(&self) -> ccm_core::Result<NodeSnapshot> {
        let request = self.client.get(self.node_url()).timeout(REQUEST_TIMEOUT);
        let node: NodeObject = self
            .send(request, "Get node")
            .await?
            .json()
            .await
            .map_err(|e| CoreError::api(format!("Invalid node object: {}", e)))?;
        Ok(node.into())
    }

    async fn patch_node_labels(&self, labels: &BTreeMap<String, String>) -> ccm_core::Result<()> {
        let body = serde_json::json!({ "metadata": { "labels": labels } });
        let request = self
            .client
            .patch(self.node_url())
            .timeout(REQUEST_TIMEOUT)
            .header(header::CONTENT_TYPE, MERGE_PATCH)
            .body(serde_json::to_vec(&body)?);
        self.send(request, "Patch node labels").await?;
        Ok(())
    }

    async fn count_pods(&self, namespace: &str, app: &str) -> ccm_core::Result<usize> {
        let url = format!("{}/api/v1/namespaces/{}/pods", self.base_url, namespace);
        let request = self.client.get(url).timeout(REQUEST_TIMEOUT).query(&[
            ("fieldSelector", format!("spec.nodeName={}", self.node_name)),
            ("labelSelector", format!("app={}", app)),
        ]);
        let pods: PodList = self
            .send(request, "List pods")
            .await?
            .json()
            .await
            .map_err(|e| CoreError::api(format!("Invalid pod list: {}", e)))?;
        Ok(pods.items.len())
    }

    async fn watch_node(
        &self,
        resource_version: Option<&str>,
        sender: mpsc::Sender<NodeEvent>,
    ) -> ccm_core::Result<()> {
        let url = format!("{}/api/v1/nodes", self.base_url);
        let mut query = vec![
            ("fieldSelector", format!("metadata.name={}", self.node_name)),
            ("watch", "true".to_string()),
            ("allowWatchBookmarks", "true".to_string()),
            ("timeoutSeconds", WATCH_TIMEOUT_SECONDS.to_string()),
        ];
        if let Some(version) = resource_version {
            query.push(("resourceVersion", version.to_string()));
        }

        let request = self
            .client
            .get(url)
            .query(&query)
            .timeout(Duration::from_secs(WATCH_TIMEOUT_SECONDS) + REQUEST_TIMEOUT);
        let mut response = self.send(request, "Watch node").await?;

        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CoreError::api(format!("Watch stream failed: {}", e)))?
        {
            buffer.extend_from_slice(&chunk);
            while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                if let Some(event) = decode_watch_line(&String::from_utf8_lossy(&line))? {
                    if sender.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        // Trailing event without a newline
        if let Some(event) = decode_watch_line(&String::from_utf8_lossy(&buffer))? {
            let _ = sender.send(event).await;
        }

        debug!("Watch on node {} closed by the server", self.node_name);
        Ok(())
    }
}
