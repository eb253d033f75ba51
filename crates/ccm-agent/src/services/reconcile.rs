//! Mode reconciliation cycle
//!
//! One cycle brings every CC-capable device on the node to the desired mode:
//! discover devices, skip if they already match, evict the dependent
//! components, switch the devices one at a time, publish the outcome and
//! restore the components.

use crate::services::eviction::ComponentCoordinator;
use ccm_adapter_gpu::{ApplyOutcome, DeviceDiscovery, ModeApplier};
use ccm_core::{CcMode, ModeStatus, NodeMetadata, Result, CC_MODE_STATE_LABEL};
use std::sync::Arc;
use tracing::{error, info, warn};

/// How a successful cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Neither the label nor the default names a mode
    NoModeSpecified,
    /// No CC-capable device on the node
    NoDevices,
    /// Every device already reported the desired mode
    AlreadyApplied(CcMode),
    /// `switched` devices were changed to `mode`
    Applied { mode: CcMode, switched: usize },
}

/// Resolve the mode a cycle should apply from the label value and the
/// configured default
pub fn resolve_target(label: &str, default: Option<CcMode>) -> Result<Option<CcMode>> {
    match CcMode::parse_target(label)? {
        Some(mode) => Ok(Some(mode)),
        None => Ok(default),
    }
}

/// Runs reconciliation cycles for one node
pub struct ModeReconciler {
    metadata: Arc<dyn NodeMetadata>,
    discovery: DeviceDiscovery,
    applier: ModeApplier,
    coordinator: Option<ComponentCoordinator>,
}

impl ModeReconciler {
    /// Create a reconciler that switches devices without evicting components
    pub fn new(
        metadata: Arc<dyn NodeMetadata>,
        discovery: DeviceDiscovery,
        applier: ModeApplier,
    ) -> Self {
        Self {
            metadata,
            discovery,
            applier,
            coordinator: None,
        }
    }

    /// Evict dependent components through `coordinator` around every switch
    pub fn with_coordinator(mut self, coordinator: ComponentCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Run one cycle towards `desired`
    pub async fn run_cycle(&self, desired: Option<CcMode>) -> Result<CycleOutcome> {
        let Some(mode) = desired else {
            info!("No CC mode specified, nothing to do");
            return Ok(CycleOutcome::NoModeSpecified);
        };

        let devices = self.discovery.discover()?;
        if devices.is_empty() {
            info!("No CC capable GPUs found on the node");
            return Ok(CycleOutcome::NoDevices);
        }
        info!("Found {} CC capable GPU(s)", devices.len());

        if self.applier.all_match(&devices, mode).await {
            info!("All GPUs already in CC mode '{}'", mode);
            self.publish_status(ModeStatus::Applied(mode)).await;
            return Ok(CycleOutcome::AlreadyApplied(mode));
        }

        let captured = match &self.coordinator {
            Some(coordinator) => {
                let captured = coordinator.capture().await?;
                if let Err(e) = coordinator.pause(&captured).await {
                    error!("Failed to evict GPU operator components: {}", e);
                    coordinator.resume(&captured).await;
                    return Err(e);
                }
                Some(captured)
            }
            None => None,
        };

        let mut switched = 0;
        for device in &devices {
            match self.applier.apply(device, mode).await {
                Ok(ApplyOutcome::Switched { .. }) => switched += 1,
                Ok(ApplyOutcome::AlreadyMatched) => {}
                Err(e) => {
                    error!("Failed to set CC mode '{}' on GPU {}: {}", mode, device, e);
                    self.publish_status(ModeStatus::Failed).await;
                    self.resume(captured.as_ref()).await;
                    return Err(e);
                }
            }
        }

        info!("CC mode '{}' applied to all GPUs", mode);
        self.publish_status(ModeStatus::Applied(mode)).await;
        self.resume(captured.as_ref()).await;

        Ok(CycleOutcome::Applied { mode, switched })
    }

    async fn resume(&self, captured: Option<&crate::services::CapturedComponents>) {
        if let (Some(coordinator), Some(captured)) = (&self.coordinator, captured) {
            coordinator.resume(captured).await;
        }
    }

    async fn publish_status(&self, status: ModeStatus) {
        match self
            .metadata
            .set_label(CC_MODE_STATE_LABEL, status.as_label_value())
            .await
        {
            Ok(()) => info!("Set {}={}", CC_MODE_STATE_LABEL, status),
            Err(e) => warn!("Failed to set {}={}: {}", CC_MODE_STATE_LABEL, status, e),
        }
    }
}
