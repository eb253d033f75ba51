//! In-memory node metadata store for testing

use async_trait::async_trait;
use ccm_core::{Component, Error, NodeEvent, NodeMetadata, NodeSnapshot, Result, PAUSED_MARKER};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Scripted outcome of one `watch_node` call
#[derive(Debug, Clone)]
pub enum WatchScript {
    /// Deliver the events, then close the watch
    Events(Vec<NodeEvent>),
    /// Fail the request with a cluster API error
    Fail(String),
}

#[derive(Debug, Default)]
struct NodeState {
    labels: BTreeMap<String, String>,
    version: u64,
}

/// Mock node metadata store
///
/// Pods of a component start leaving once its deployment label is paused,
/// one pod per `count_pods` poll, unless the component is marked stuck.
/// After the scripted watches are used up, `watch_node` stays open and
/// receives a `Modified` event for every label change.
#[derive(Debug, Default)]
pub struct MockNodeMetadata {
    node_name: String,
    state: Mutex<NodeState>,
    pods: Mutex<HashMap<String, usize>>,
    evicting: Mutex<HashSet<String>>,
    stuck: HashSet<String>,
    failing_labels: HashSet<String>,
    fail_reads: Mutex<usize>,
    fail_pod_counts: Mutex<usize>,
    patches: Mutex<Vec<BTreeMap<String, String>>>,
    pod_queries: Mutex<Vec<(String, String)>>,
    watch_script: Mutex<VecDeque<WatchScript>>,
    watch_versions: Mutex<Vec<Option<String>>>,
    live_watchers: Mutex<Vec<mpsc::Sender<NodeEvent>>>,
    reads: Mutex<usize>,
}

impl MockNodeMetadata {
    /// Create a store for `node_name` with no labels
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            ..Default::default()
        }
    }

    /// Set an initial label
    pub fn with_label(self, key: &str, value: &str) -> Self {
        {
            let mut state = lock(&self.state);
            state.labels.insert(key.to_string(), value.to_string());
            state.version += 1;
        }
        self
    }

    /// Run `count` pods of `component` on the node
    pub fn with_pods(self, component: Component, count: usize) -> Self {
        lock(&self.pods).insert(component.app_label().to_string(), count);
        self
    }

    /// Keep the pods of `component` on the node regardless of its label
    pub fn with_stuck_component(mut self, component: Component) -> Self {
        self.stuck.insert(component.app_label().to_string());
        self
    }

    /// Fail every patch that touches `key`
    pub fn with_patch_failure(mut self, key: &str) -> Self {
        self.failing_labels.insert(key.to_string());
        self
    }

    /// Fail the next `count` reads of the node object
    pub fn with_read_failures(self, count: usize) -> Self {
        *lock(&self.fail_reads) = count;
        self
    }

    /// Fail the next `count` pod listings with a cluster API error
    pub fn with_pod_count_failures(self, count: usize) -> Self {
        *lock(&self.fail_pod_counts) = count;
        self
    }

    /// Queue a scripted watch outcome
    pub fn with_watch(self, script: WatchScript) -> Self {
        lock(&self.watch_script).push_back(script);
        self
    }

    /// Current value of a label, empty when absent
    pub fn label(&self, key: &str) -> String {
        lock(&self.state).labels.get(key).cloned().unwrap_or_default()
    }

    /// Whether the label is present at all
    pub fn has_label(&self, key: &str) -> bool {
        lock(&self.state).labels.contains_key(key)
    }

    /// Remove a label as an external actor would
    pub async fn remove_label(&self, key: &str) {
        let snapshot = {
            let mut state = lock(&self.state);
            state.labels.remove(key);
            state.version += 1;
            Self::snapshot_of(&state)
        };
        self.broadcast(snapshot).await;
    }

    /// Change a label as an external actor would
    pub async fn update_label(&self, key: &str, value: &str) {
        let mut labels = BTreeMap::new();
        labels.insert(key.to_string(), value.to_string());
        let snapshot = self.apply_patch(&labels);
        self.broadcast(snapshot).await;
    }

    /// Remaining pods of `component`
    pub fn pods(&self, component: Component) -> usize {
        lock(&self.pods)
            .get(component.app_label())
            .copied()
            .unwrap_or(0)
    }

    /// Label patches received through the trait, in order
    pub fn patches(&self) -> Vec<BTreeMap<String, String>> {
        lock(&self.patches).clone()
    }

    /// Values written to `key` through the trait, in order
    pub fn writes_to(&self, key: &str) -> Vec<String> {
        lock(&self.patches)
            .iter()
            .filter_map(|patch| patch.get(key).cloned())
            .collect()
    }

    /// `(namespace, app)` pairs queried through `count_pods`
    pub fn pod_queries(&self) -> Vec<(String, String)> {
        lock(&self.pod_queries).clone()
    }

    /// Resource versions passed to each `watch_node` call
    pub fn watch_versions(&self) -> Vec<Option<String>> {
        lock(&self.watch_versions).clone()
    }

    /// Number of `get_node` calls
    pub fn reads(&self) -> usize {
        *lock(&self.reads)
    }

    fn snapshot_of(state: &NodeState) -> NodeSnapshot {
        NodeSnapshot {
            labels: state.labels.clone(),
            resource_version: Some(state.version.to_string()),
        }
    }

    fn apply_patch(&self, labels: &BTreeMap<String, String>) -> NodeSnapshot {
        let mut state = lock(&self.state);
        for (key, value) in labels {
            state.labels.insert(key.clone(), value.clone());

            if let Some(component) = Component::ALL.iter().find(|c| c.label_key() == key) {
                let mut evicting = lock(&self.evicting);
                if value.contains(PAUSED_MARKER) {
                    evicting.insert(component.app_label().to_string());
                } else {
                    evicting.remove(component.app_label());
                }
            }
        }
        state.version += 1;
        Self::snapshot_of(&state)
    }

    async fn broadcast(&self, snapshot: NodeSnapshot) {
        let watchers: Vec<_> = lock(&self.live_watchers).clone();
        for watcher in watchers {
            let _ = watcher.send(NodeEvent::Modified(snapshot.clone())).await;
        }
    }
}

#[async_trait]
impl NodeMetadata for MockNodeMetadata {
    fn node_name(&self) -> &str {
        &self.node_name
    }

    async fn get_node(&self) -> Result<NodeSnapshot> {
        *lock(&self.reads) += 1;
        {
            let mut fail_reads = lock(&self.fail_reads);
            if *fail_reads > 0 {
                *fail_reads -= 1;
                return Err(Error::api("mock read failure"));
            }
        }
        Ok(Self::snapshot_of(&lock(&self.state)))
    }

    async fn patch_node_labels(&self, labels: &BTreeMap<String, String>) -> Result<()> {
        if let Some(key) = labels.keys().find(|k| self.failing_labels.contains(*k)) {
            return Err(Error::api(format!("mock patch failure on {}", key)));
        }
        debug!("Mock patch: {:?}", labels);
        lock(&self.patches).push(labels.clone());
        let snapshot = self.apply_patch(labels);
        self.broadcast(snapshot).await;
        Ok(())
    }

    async fn count_pods(&self, namespace: &str, app: &str) -> Result<usize> {
        lock(&self.pod_queries).push((namespace.to_string(), app.to_string()));
        {
            let mut fail_pod_counts = lock(&self.fail_pod_counts);
            if *fail_pod_counts > 0 {
                *fail_pod_counts -= 1;
                return Err(Error::api("mock pod list failure"));
            }
        }

        let mut pods = lock(&self.pods);
        let count = pods.entry(app.to_string()).or_insert(0);
        let current = *count;
        if current > 0 && !self.stuck.contains(app) && lock(&self.evicting).contains(app) {
            *count -= 1;
        }
        Ok(current)
    }

    async fn watch_node(
        &self,
        resource_version: Option<&str>,
        sender: mpsc::Sender<NodeEvent>,
    ) -> Result<()> {
        lock(&self.watch_versions).push(resource_version.map(str::to_string));

        let script = lock(&self.watch_script).pop_front();
        match script {
            Some(WatchScript::Events(events)) => {
                for event in events {
                    if sender.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(())
            }
            Some(WatchScript::Fail(message)) => Err(Error::api(message)),
            None => {
                lock(&self.live_watchers).push(sender.clone());
                sender.closed().await;
                Ok(())
            }
        }
    }
}
