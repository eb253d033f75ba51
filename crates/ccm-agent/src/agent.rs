//! Core agent implementation

use crate::config::AgentConfig;
use crate::kube::KubeClient;
use crate::services::reconcile::resolve_target;
use crate::services::{ComponentCoordinator, CycleOutcome, LabelSubscription, ModeReconciler};
use crate::watcher::LabelWatcher;
use crate::{AgentError, Result};
use ccm_adapter_gpu::{DeviceDiscovery, GpuAdminTool, ModeApplier, ModeTool, PciBus, SysfsPciBus};
use ccm_core::{CcMode, Error as CoreError, NodeMetadata, CC_MODE_LABEL, CC_MODE_STATE_LABEL};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The CC mode agent for one node
pub struct Agent {
    config: AgentConfig,
    metadata: Arc<dyn NodeMetadata>,
    reconciler: ModeReconciler,
    default_mode: Option<CcMode>,
    watcher: Arc<LabelWatcher>,
    subscription: Option<JoinHandle<Result<()>>>,
}

impl Agent {
    /// Get the agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Apply the mode named by the node label at startup, then start the
    /// label subscription.
    ///
    /// A failure here is fatal: the node is left in an unverified state.
    pub async fn start(&mut self) -> Result<CycleOutcome> {
        info!("Starting k8s-cc-manager on node {}", self.metadata.node_name());

        let node = self.metadata.get_node().await?;
        let label = node.label(CC_MODE_LABEL).to_string();
        info!("Initial {} label: '{}'", CC_MODE_LABEL, label);

        let outcome = self.reconcile(&label).await?;
        info!("Initial CC mode reconciliation finished: {:?}", outcome);

        write_readiness_file(&self.config.cc_readiness_file);

        // Seeded with the applied value so that removing the label later is
        // seen as a change
        self.watcher = Arc::new(LabelWatcher::with_initial(label));
        self.subscription = Some(
            LabelSubscription::new(self.metadata.clone(), self.watcher.clone(), &node).spawn(),
        );

        Ok(outcome)
    }

    /// Stop the label subscription
    pub async fn stop(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!("k8s-cc-manager stopped");
    }

    /// Run the agent until SIGTERM or SIGINT
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(wait_for_termination()).await
    }

    /// Run the agent until `shutdown` completes
    ///
    /// The shutdown signal is only observed between cycles; a cycle in
    /// flight always runs to completion.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;

        tokio::pin!(shutdown);
        let watcher = self.watcher.clone();

        let result = loop {
            let label = tokio::select! {
                label = watcher.get() => label,
                exit = subscription_exit(&mut self.subscription) => {
                    break Err(exit);
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break Ok(());
                }
            };

            match self.reconcile(&label).await {
                Ok(outcome) => info!("CC mode reconciliation finished: {:?}", outcome),
                Err(e) => error!("CC mode reconciliation failed: {}", e),
            }
        };

        self.stop().await;
        result
    }

    /// Run one cycle for a label value, substituting the default when empty
    pub async fn reconcile(&self, label: &str) -> Result<CycleOutcome> {
        let desired = resolve_target(label, self.default_mode)?;
        if label.trim().is_empty() {
            if let Some(mode) = desired {
                info!("No CC mode label set, using default '{}'", mode);
            }
        }

        let result = self.reconciler.run_cycle(desired).await;
        if let Err(e) = &result {
            self.report_failure(e);
        }
        Ok(result?)
    }

    fn report_failure(&self, error: &CoreError) {
        if error.is_eviction_timeout() {
            warn!(
                "GPU operator components did not leave the node within {}s; \
                 their labels were restored and no GPU was changed",
                self.config.eviction_timeout_seconds
            );
        } else if error.is_device_failure() {
            warn!(
                "GPUs on node {} may be left in mixed CC modes; {} reports failed",
                self.metadata.node_name(),
                CC_MODE_STATE_LABEL
            );
        } else if error.is_retryable() {
            warn!("Transient failure; the mode is applied again on the next label change");
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.abort();
        }
    }
}

/// Resolves when the subscription task ends; it never ends successfully
async fn subscription_exit(handle: &mut Option<JoinHandle<Result<()>>>) -> AgentError {
    let Some(task) = handle.as_mut() else {
        return std::future::pending().await;
    };

    let error = match task.await {
        Ok(Err(e)) => e,
        Ok(Ok(())) => AgentError::Subscription("label subscription ended".to_string()),
        Err(e) => AgentError::Subscription(format!("label subscription task failed: {}", e)),
    };
    *handle = None;
    error!("{}", error);
    error
}

fn write_readiness_file(path: &Path) {
    let result = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|_| std::fs::write(path, b""));

    match result {
        Ok(()) => info!("Created readiness file {}", path.display()),
        Err(e) => warn!("Failed to create readiness file {}: {}", path.display(), e),
    }
}

/// Wait for termination signals (SIGTERM, SIGINT)
#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                warn!("Failed to install signal handlers, waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
}

/// Wait for termination signals (non-unix)
#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Builder for creating agents
#[derive(Default)]
pub struct AgentBuilder {
    config: Option<AgentConfig>,
    metadata: Option<Arc<dyn NodeMetadata>>,
    bus: Option<Arc<dyn PciBus>>,
    tool: Option<Arc<dyn ModeTool>>,
}

impl AgentBuilder {
    /// Create a new agent builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent configuration
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `metadata` instead of the Kubernetes API
    pub fn with_metadata(mut self, metadata: Arc<dyn NodeMetadata>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Use `bus` instead of sysfs
    pub fn with_pci_bus(mut self, bus: Arc<dyn PciBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use `tool` instead of the GPU admin tool
    pub fn with_mode_tool(mut self, tool: Arc<dyn ModeTool>) -> Self {
        self.tool = Some(tool);
        self
    }

    /// Build the agent
    pub async fn build(self) -> Result<Agent> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let gpu_config = config.gpu_config()?;
        gpu_config.validate()?;
        let default_mode = config.default_mode()?;

        let metadata = match self.metadata {
            Some(metadata) => metadata,
            None => Arc::new(KubeClient::from_config(&config)?),
        };
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(SysfsPciBus::new(&gpu_config.sysfs_root)));
        let tool = self
            .tool
            .unwrap_or_else(|| Arc::new(GpuAdminTool::new(&gpu_config.tool_path)));

        let discovery = DeviceDiscovery::new(bus.clone(), gpu_config.capable_device_ids.clone());
        let applier = ModeApplier::new(bus, tool);
        let mut reconciler = ModeReconciler::new(metadata.clone(), discovery, applier);

        if config.evict_operator_components {
            info!(
                "Evicting GPU operator components in namespace {} before mode changes",
                config.operator_namespace
            );
            reconciler = reconciler.with_coordinator(
                ComponentCoordinator::new(metadata.clone(), config.operator_namespace.clone())
                    .with_timeout(config.eviction_timeout())
                    .with_poll_interval(config.eviction_poll_interval()),
            );
        } else {
            info!("GPU operator component eviction is disabled");
        }

        Ok(Agent {
            config,
            metadata,
            reconciler,
            default_mode,
            watcher: Arc::new(LabelWatcher::new()),
            subscription: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNodeMetadata;
    use ccm_adapter_gpu::mock::{MockModeTool, MockPciBus};
    use ccm_core::{Component, Device, CC_MODE_STATE_LABEL};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const GPU0: &str = "0000:41:00.0";

    fn config(temp_dir: &TempDir, default_mode: &str) -> AgentConfig {
        AgentConfig {
            node_name: "gpu-node-1".to_string(),
            cc_capable_device_ids: "0x2331".to_string(),
            default_cc_mode: default_mode.to_string(),
            cc_readiness_file: temp_dir.path().join("validations/.cc-manager-ctr-ready"),
            eviction_timeout_seconds: 1,
            eviction_poll_interval_seconds: 1,
            ..Default::default()
        }
    }

    async fn build(
        config: AgentConfig,
        metadata: &Arc<MockNodeMetadata>,
        tool: &Arc<MockModeTool>,
    ) -> Agent {
        let bus = MockPciBus::new(vec![Device::new(GPU0, 0x10de, 0x030200, 0x2331)]);
        AgentBuilder::new()
            .with_config(config)
            .with_metadata(metadata.clone())
            .with_pci_bus(Arc::new(bus))
            .with_mode_tool(tool.clone())
            .build()
            .await
            .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_builder_validates_config() {
        let result = AgentBuilder::new()
            .with_config(AgentConfig::default())
            .with_metadata(Arc::new(MockNodeMetadata::new("gpu-node-1")))
            .build()
            .await;
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_applies_label_and_signals_readiness() {
        let temp_dir = TempDir::new().unwrap();
        let metadata = Arc::new(
            MockNodeMetadata::new("gpu-node-1")
                .with_label(CC_MODE_LABEL, "on")
                .with_label(Component::VfioManager.label_key(), "true"),
        );
        let tool = Arc::new(MockModeTool::new().with_mode(GPU0, CcMode::Off));
        let mut agent = build(config(&temp_dir, ""), &metadata, &tool).await;

        let outcome = agent.start().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Applied {
                mode: CcMode::On,
                switched: 1
            }
        );
        assert_eq!(tool.mode(GPU0), Some(CcMode::On));
        assert_eq!(metadata.label(CC_MODE_STATE_LABEL), "on");
        assert_eq!(metadata.label(Component::VfioManager.label_key()), "true");
        assert!(agent.config().cc_readiness_file.exists());

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_initial_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let metadata = Arc::new(MockNodeMetadata::new("gpu-node-1").with_label(CC_MODE_LABEL, "on"));
        let tool = Arc::new(
            MockModeTool::new()
                .with_mode(GPU0, CcMode::Off)
                .with_set_failure(GPU0),
        );
        let mut agent = build(config(&temp_dir, ""), &metadata, &tool).await;

        let result = agent.run_until(std::future::pending()).await;
        assert!(matches!(result, Err(AgentError::Core(_))));
        assert_eq!(metadata.label(CC_MODE_STATE_LABEL), "failed");
        assert!(!agent.config().cc_readiness_file.exists());
    }

    #[tokio::test]
    async fn test_invalid_initial_label_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let metadata =
            Arc::new(MockNodeMetadata::new("gpu-node-1").with_label(CC_MODE_LABEL, "enabled"));
        let tool = Arc::new(MockModeTool::new().with_mode(GPU0, CcMode::Off));
        let mut agent = build(config(&temp_dir, "on"), &metadata, &tool).await;

        assert!(agent.start().await.is_err());
        assert_eq!(tool.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_nothing_specified_at_startup() {
        let temp_dir = TempDir::new().unwrap();
        let metadata = Arc::new(MockNodeMetadata::new("gpu-node-1"));
        let tool = Arc::new(MockModeTool::new().with_mode(GPU0, CcMode::Off));
        let mut agent = build(config(&temp_dir, ""), &metadata, &tool).await;

        assert_eq!(agent.start().await.unwrap(), CycleOutcome::NoModeSpecified);
        assert!(tool.calls().is_empty());
        assert!(agent.config().cc_readiness_file.exists());

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_removed_label_falls_back_to_default() {
        let temp_dir = TempDir::new().unwrap();
        let metadata = Arc::new(MockNodeMetadata::new("gpu-node-1").with_label(CC_MODE_LABEL, "off"));
        let tool = Arc::new(MockModeTool::new().with_mode(GPU0, CcMode::Off));
        let mut agent = build(config(&temp_dir, "on"), &metadata, &tool).await;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let run = tokio::spawn(async move {
            agent
                .run_until(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        // Initial apply is a no-op; wait for the subscription to be live
        eventually(|| !metadata.watch_versions().is_empty()).await;
        assert_eq!(tool.mutation_count(), 0);

        metadata.remove_label(CC_MODE_LABEL).await;
        eventually(|| tool.mode(GPU0) == Some(CcMode::On)).await;
        eventually(|| metadata.label(CC_MODE_STATE_LABEL) == "on").await;

        shutdown_tx.send(()).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_later_failure_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let metadata = Arc::new(MockNodeMetadata::new("gpu-node-1").with_label(CC_MODE_LABEL, "off"));
        let tool = Arc::new(
            MockModeTool::new()
                .with_mode(GPU0, CcMode::Off)
                .with_set_failure(GPU0),
        );
        let mut agent = build(config(&temp_dir, ""), &metadata, &tool).await;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let run = tokio::spawn(async move {
            agent
                .run_until(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        eventually(|| !metadata.watch_versions().is_empty()).await;

        metadata.update_label(CC_MODE_LABEL, "on").await;
        eventually(|| metadata.label(CC_MODE_STATE_LABEL) == "failed").await;

        // Still reacting to label changes after the failure
        metadata.update_label(CC_MODE_LABEL, "off").await;
        eventually(|| metadata.writes_to(CC_MODE_STATE_LABEL).len() == 3).await;
        assert_eq!(
            metadata.writes_to(CC_MODE_STATE_LABEL),
            vec!["off", "failed", "off"]
        );

        shutdown_tx.send(()).unwrap();
        run.await.unwrap().unwrap();
    }

    #[test]
    fn test_readiness_file_failure_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        // Parent is a regular file
        write_readiness_file(&blocker.join("ready"));
        assert!(!blocker.join("ready").exists());
    }
}
