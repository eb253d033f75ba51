//! Node label subscription
//!
//! Watches the node object and feeds every change of the mode label into the
//! [`LabelWatcher`]. The watch is re-established whenever the server closes
//! it; an expired resource version triggers a fresh read of the node.

use crate::watcher::LabelWatcher;
use crate::{AgentError, Result};
use ccm_core::{Error as CoreError, NodeEvent, NodeMetadata, NodeSnapshot, CC_MODE_LABEL};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before re-establishing a failed watch
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Consecutive failures after which the subscription gives up
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

const HTTP_GONE: u16 = 410;
const EVENT_BUFFER: usize = 16;

/// Outcome of one watch request as seen by the consumer
#[derive(Debug, Default)]
struct WatchRound {
    expired: bool,
    failure: Option<String>,
}

/// Background producer for the [`LabelWatcher`]
pub struct LabelSubscription {
    metadata: Arc<dyn NodeMetadata>,
    watcher: Arc<LabelWatcher>,
    label: String,
    reconnect_delay: Duration,
    max_errors: u32,
    last_value: String,
    resource_version: Option<String>,
}

impl LabelSubscription {
    /// Create a subscription starting from the node as read at startup
    pub fn new(
        metadata: Arc<dyn NodeMetadata>,
        watcher: Arc<LabelWatcher>,
        initial: &NodeSnapshot,
    ) -> Self {
        Self {
            metadata,
            watcher,
            label: CC_MODE_LABEL.to_string(),
            reconnect_delay: RECONNECT_DELAY,
            max_errors: MAX_CONSECUTIVE_ERRORS,
            last_value: initial.label(CC_MODE_LABEL).to_string(),
            resource_version: initial.resource_version.clone(),
        }
    }

    /// Set the delay before reconnecting after a failure
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the number of consecutive failures tolerated
    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors;
        self
    }

    /// Run the subscription on its own task
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Run until the failure budget is exhausted
    pub async fn run(mut self) -> Result<()> {
        info!(
            "Watching label {} on node {}",
            self.label,
            self.metadata.node_name()
        );
        let mut consecutive_errors = 0;

        loop {
            let round = self.watch_once().await;

            let failure = if round.expired {
                warn!("Resource version expired, re-reading node");
                self.resync().await.err().map(|e| e.to_string())
            } else {
                round.failure
            };

            match failure {
                None => consecutive_errors = 0,
                Some(message) => {
                    consecutive_errors += 1;
                    error!(
                        "Label watch failed ({}/{}): {}",
                        consecutive_errors, self.max_errors, message
                    );
                    if consecutive_errors >= self.max_errors {
                        return Err(AgentError::Subscription(format!(
                            "giving up after {} consecutive errors: {}",
                            consecutive_errors, message
                        )));
                    }
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    async fn watch_once(&mut self) -> WatchRound {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let metadata = self.metadata.clone();
        let version = self.resource_version.clone();

        let watch = async move { metadata.watch_node(version.as_deref(), tx).await };
        let consume = async {
            let mut round = WatchRound::default();
            while let Some(event) = rx.recv().await {
                match event {
                    NodeEvent::Added(snapshot) | NodeEvent::Modified(snapshot) => {
                        self.observe(&snapshot).await;
                    }
                    NodeEvent::Deleted(_) => warn!("Node {} was deleted", self.metadata.node_name()),
                    NodeEvent::Bookmark { resource_version } => {
                        self.resource_version = Some(resource_version);
                    }
                    NodeEvent::Error { code, .. } if code == HTTP_GONE => round.expired = true,
                    NodeEvent::Error { code, message } => {
                        round.failure = Some(format!("watch error {}: {}", code, message));
                    }
                }
            }
            round
        };

        let (result, mut round) = tokio::join!(watch, consume);
        match result {
            Ok(()) => debug!("Watch closed, reconnecting"),
            Err(CoreError::Gone(_)) => round.expired = true,
            Err(e) => round.failure = Some(e.to_string()),
        }
        round
    }

    async fn resync(&mut self) -> ccm_core::Result<()> {
        let snapshot = self.metadata.get_node().await?;
        self.observe(&snapshot).await;
        Ok(())
    }

    async fn observe(&mut self, snapshot: &NodeSnapshot) {
        if snapshot.resource_version.is_some() {
            self.resource_version = snapshot.resource_version.clone();
        }

        let value = snapshot.label(&self.label);
        if value != self.last_value {
            info!("Label {} changed: '{}' -> '{}'", self.label, self.last_value, value);
            self.last_value = value.to_string();
            self.watcher.set(value).await;
        }
    }
}
