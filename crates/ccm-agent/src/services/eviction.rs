//! Dependent-component coordinator
//!
//! GPU operator components that hold the devices are evicted by pausing
//! their deployment labels on the node; the operator then removes their
//! pods. After the mode switch the captured label values are restored.

use ccm_core::{Component, ComponentState, Error, NodeMetadata, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Default time allowed for a component's pods to leave the node
pub const DEFAULT_EVICTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between pod checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Component deployment labels as read at the start of a cycle
///
/// Components whose label is absent from the node are not captured and are
/// never written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedComponents {
    states: BTreeMap<Component, ComponentState>,
}

impl CapturedComponents {
    /// Capture from a set of node labels
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        let states = Component::ALL
            .iter()
            .filter_map(|component| {
                labels
                    .get(component.label_key())
                    .map(|value| (*component, ComponentState::from_label(value)))
            })
            .collect();
        Self { states }
    }

    /// Captured state of a component
    pub fn get(&self, component: Component) -> Option<&ComponentState> {
        self.states.get(&component)
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Components that were deployed before pausing and must vacate the node
    pub fn enabled(&self) -> Vec<Component> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_enabled())
            .map(|(component, _)| *component)
            .collect()
    }

    /// Label values that pause every captured component
    pub fn pause_labels(&self) -> BTreeMap<String, String> {
        self.transform(ComponentState::paused)
    }

    /// Label values that restore every captured component
    pub fn resume_labels(&self) -> BTreeMap<String, String> {
        self.transform(ComponentState::resumed)
    }

    fn transform(&self, f: impl Fn(&ComponentState) -> ComponentState) -> BTreeMap<String, String> {
        self.states
            .iter()
            .map(|(component, state)| {
                let next = f(state);
                debug!(
                    "  {}: '{}' -> '{}'",
                    component.label_key(),
                    state.to_label(),
                    next.to_label()
                );
                (component.label_key().to_string(), next.to_label().to_string())
            })
            .collect()
    }
}

/// Pauses and restores the GPU operator components on one node
pub struct ComponentCoordinator {
    metadata: Arc<dyn NodeMetadata>,
    namespace: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl ComponentCoordinator {
    /// Create a coordinator for components running in `namespace`
    pub fn new(metadata: Arc<dyn NodeMetadata>, namespace: impl Into<String>) -> Self {
        Self {
            metadata,
            namespace: namespace.into(),
            timeout: DEFAULT_EVICTION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the per-component eviction timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the interval between pod checks
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Read the current component labels from the node
    pub async fn capture(&self) -> Result<CapturedComponents> {
        let node = self.metadata.get_node().await?;
        let captured = CapturedComponents::from_labels(&node.labels);
        for component in Component::ALL {
            match captured.get(component) {
                Some(state) => info!("  {}={}", component.label_key(), state),
                None => debug!("  {} is not set", component.label_key()),
            }
        }
        Ok(captured)
    }

    /// Pause every captured component and wait for the deployed ones to
    /// leave the node
    pub async fn pause(&self, captured: &CapturedComponents) -> Result<()> {
        if captured.is_empty() {
            info!("No GPU operator component labels on the node, nothing to evict");
            return Ok(());
        }

        info!("Evicting GPU operator components");
        self.metadata
            .patch_node_labels(&captured.pause_labels())
            .await?;

        for component in captured.enabled() {
            self.wait_for_eviction(component).await?;
        }

        info!("All GPU operator components evicted");
        Ok(())
    }

    /// Wait until no pod of `component` runs on the node
    pub async fn wait_for_eviction(&self, component: Component) -> Result<()> {
        let app = component.app_label();
        let deadline = Instant::now() + self.timeout;
        info!("Waiting for {} pods to be deleted", app);

        loop {
            match self.metadata.count_pods(&self.namespace, app).await {
                Ok(0) => {
                    info!("{} pods deleted", app);
                    return Ok(());
                }
                Ok(remaining) => debug!("Still waiting for {} {} pod(s)", remaining, app),
                Err(e) if e.is_retryable() => warn!("Error checking {} pods: {}", app, e),
                Err(e) => return Err(e),
            }

            // The last poll happens at the deadline itself
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::EvictionTimeout {
                    component: component.name().to_string(),
                    timeout: self.timeout,
                });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Restore every captured component; failures are logged
    pub async fn resume(&self, captured: &CapturedComponents) {
        if captured.is_empty() {
            return;
        }

        info!("Rescheduling GPU operator components");
        match self
            .metadata
            .patch_node_labels(&captured.resume_labels())
            .await
        {
            Ok(()) => info!("Restored GPU operator component labels"),
            Err(e) => warn!("Failed to restore GPU operator component labels: {}", e),
        }
    }
}
