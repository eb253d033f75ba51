//! Per-device CC mode applier
//!
//! Drives one device through query, unbind, switch-and-reset and reassert.
//! Failures are never retried here; the caller decides what a failed device
//! means for the rest of the node.

use crate::discovery::PciBus;
use crate::tool::ModeTool;
use ccm_core::{CcMode, Device, Error, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of applying a mode to one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The device was already in the desired mode; nothing was touched
    AlreadyMatched,
    /// The device was switched from `from` and verified
    Switched { from: CcMode },
}

/// Applies CC modes to individual devices
#[derive(Clone)]
pub struct ModeApplier {
    bus: Arc<dyn PciBus>,
    tool: Arc<dyn ModeTool>,
}

impl ModeApplier {
    /// Create an applier over the given bus and tool
    pub fn new(bus: Arc<dyn PciBus>, tool: Arc<dyn ModeTool>) -> Self {
        Self { bus, tool }
    }

    /// Query a device's current mode
    pub async fn query(&self, device: &Device) -> Result<CcMode> {
        self.tool.query_mode(device).await
    }

    /// Query every device, stopping at the first failure
    pub async fn query_all(&self, devices: &[Device]) -> Result<Vec<(Device, CcMode)>> {
        let mut modes = Vec::with_capacity(devices.len());
        for device in devices {
            let mode = self.query(device).await?;
            modes.push((device.clone(), mode));
        }
        Ok(modes)
    }

    /// Whether every device already reports `mode`.
    ///
    /// A device whose mode cannot be read counts as not matching, so the
    /// caller falls through to the full apply path where the failure is
    /// reported properly.
    pub async fn all_match(&self, devices: &[Device], mode: CcMode) -> bool {
        for device in devices {
            match self.query(device).await {
                Ok(current) if current == mode => {}
                Ok(_) => return false,
                Err(e) => {
                    error!("Failed to query CC mode on {}: {}", device.bus_id, e);
                    return false;
                }
            }
        }
        true
    }

    /// Drive one device into `mode`
    pub async fn apply(&self, device: &Device, mode: CcMode) -> Result<ApplyOutcome> {
        let current = self.query(device).await?;
        if current == mode {
            info!("GPU {} already in CC mode '{}', skipping", device.bus_id, mode);
            return Ok(ApplyOutcome::AlreadyMatched);
        }

        info!(
            "Setting CC mode on GPU {} from '{}' to '{}'",
            device.bus_id, current, mode
        );

        match self.bus.unbind(device)? {
            Some(driver) => info!("Unbound GPU {} from driver {}", device.bus_id, driver),
            None => info!("GPU {} has no bound driver", device.bus_id),
        }

        self.tool.set_mode_and_reset(device, mode).await?;

        let reasserted = self.query(device).await?;
        if reasserted != mode {
            warn!(
                "GPU {} reports CC mode '{}' after switching to '{}'",
                device.bus_id, reasserted, mode
            );
            return Err(Error::AssertionMismatch {
                device: device.bus_id.clone(),
                expected: mode,
                actual: reasserted,
            });
        }

        info!("Successfully set CC mode to '{}' on GPU {}", mode, device.bus_id);
        Ok(ApplyOutcome::Switched { from: current })
    }

    /// Reset a device without changing its mode
    pub async fn reset(&self, device: &Device) -> Result<()> {
        info!("Resetting GPU {}", device.bus_id);
        self.tool.reset(device).await
    }
}
