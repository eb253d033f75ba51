//! Capability traits consumed by the agent
//!
//! The cluster metadata store is an external collaborator. The agent only
//! needs a handful of node-scoped operations on it, expressed by
//! [`NodeMetadata`]; the production implementation talks to the Kubernetes
//! API server and tests use an in-memory store.

use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Labels and version of the node object as last read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Node labels
    pub labels: BTreeMap<String, String>,

    /// Opaque resource version of the node object
    pub resource_version: Option<String>,
}

impl NodeSnapshot {
    /// Value of a label, empty when absent
    pub fn label(&self, key: &str) -> &str {
        self.labels.get(key).map(String::as_str).unwrap_or("")
    }
}

/// A change event delivered by a node watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Added(NodeSnapshot),
    Modified(NodeSnapshot),
    Deleted(NodeSnapshot),
    /// Progress notification carrying only a resource version
    Bookmark { resource_version: String },
    /// The watch failed server-side (410 means the version expired)
    Error { code: u16, message: String },
}

/// Node-scoped access to the cluster metadata store
#[async_trait]
pub trait NodeMetadata: Send + Sync {
    /// Name of the node this handle is bound to
    fn node_name(&self) -> &str;

    /// Read the node's labels and resource version
    async fn get_node(&self) -> Result<NodeSnapshot>;

    /// Merge the given labels into the node's labels
    async fn patch_node_labels(&self, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Count pods in `namespace` on this node carrying `app=<app>`
    async fn count_pods(&self, namespace: &str, app: &str) -> Result<usize>;

    /// Watch the node object starting after `resource_version`, forwarding
    /// events to `sender`. Returns when the server closes the watch or the
    /// receiver is dropped.
    async fn watch_node(
        &self,
        resource_version: Option<&str>,
        sender: mpsc::Sender<NodeEvent>,
    ) -> Result<()>;

    /// Read a single label, empty when absent
    async fn get_label(&self, key: &str) -> Result<String> {
        Ok(self.get_node().await?.label(key).to_string())
    }

    /// Set a single label
    async fn set_label(&self, key: &str, value: &str) -> Result<()> {
        let mut labels = BTreeMap::new();
        labels.insert(key.to_string(), value.to_string());
        self.patch_node_labels(&labels).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_label_lookup() {
        let mut snapshot = NodeSnapshot::default();
        snapshot
            .labels
            .insert("nvidia.com/cc.mode".to_string(), "on".to_string());

        assert_eq!(snapshot.label("nvidia.com/cc.mode"), "on");
        assert_eq!(snapshot.label("nvidia.com/cc.mode.state"), "");
    }
}
