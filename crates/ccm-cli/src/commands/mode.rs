//! CC mode commands

use crate::output::{colorize_mode, Formattable, OutputFormat, OutputFormatter};
use anyhow::{Context, Result};
use ccm_adapter_gpu::{ApplyOutcome, DeviceDiscovery, ModeApplier};
use ccm_core::{CcMode, Device};
use serde::Serialize;
use tracing::info;

use super::DeviceSelector;

/// Per-device result for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceModeInfo {
    pub bus_id: String,
    pub device_id: String,
    pub mode: String,
    pub action: String,
}

impl DeviceModeInfo {
    fn new(device: &Device, mode: impl ToString, action: &str) -> Self {
        Self {
            bus_id: device.bus_id.clone(),
            device_id: format!("{:#06x}", device.device_id),
            mode: mode.to_string(),
            action: action.to_string(),
        }
    }
}

impl Formattable for DeviceModeInfo {
    fn table_headers() -> Vec<String> {
        vec![
            "GPU".to_string(),
            "Device ID".to_string(),
            "CC Mode".to_string(),
            "Action".to_string(),
        ]
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.bus_id.clone(),
            self.device_id.clone(),
            colorize_mode(&self.mode),
            self.action.clone(),
        ]
    }

    fn text_line(&self) -> String {
        if self.action.is_empty() {
            format!("{} {}", self.bus_id, self.mode)
        } else {
            format!("{} {} ({})", self.bus_id, self.mode, self.action)
        }
    }
}

/// Query the CC mode of the selected devices
pub async fn query_modes(
    discovery: &DeviceDiscovery,
    applier: &ModeApplier,
    selector: &DeviceSelector,
) -> Result<Vec<DeviceModeInfo>> {
    let devices = selector.select(discovery)?;
    let modes = applier
        .query_all(&devices)
        .await
        .context("Failed to query CC mode")?;

    Ok(modes
        .iter()
        .map(|(device, mode)| DeviceModeInfo::new(device, mode, ""))
        .collect())
}

/// Switch the selected devices to `mode`, stopping at the first failure
pub async fn apply_mode(
    discovery: &DeviceDiscovery,
    applier: &ModeApplier,
    selector: &DeviceSelector,
    mode: CcMode,
) -> Result<Vec<DeviceModeInfo>> {
    let devices = selector.select(discovery)?;
    info!("Setting CC mode to '{}' on {} GPU(s)", mode, devices.len());

    let mut results = Vec::with_capacity(devices.len());
    for device in &devices {
        let outcome = applier
            .apply(device, mode)
            .await
            .with_context(|| format!("Failed to set CC mode '{}' on GPU {}", mode, device.bus_id))?;

        let action = match outcome {
            ApplyOutcome::AlreadyMatched => "unchanged".to_string(),
            ApplyOutcome::Switched { from } => format!("switched from {}", from),
        };
        results.push(DeviceModeInfo::new(device, mode, &action));
    }
    Ok(results)
}

/// Reset the selected devices without changing their mode
pub async fn reset_devices(
    discovery: &DeviceDiscovery,
    applier: &ModeApplier,
    selector: &DeviceSelector,
) -> Result<Vec<DeviceModeInfo>> {
    let devices = selector.select(discovery)?;

    let mut results = Vec::with_capacity(devices.len());
    for device in &devices {
        applier
            .reset(device)
            .await
            .with_context(|| format!("Failed to reset GPU {}", device.bus_id))?;
        let mode = applier
            .query(device)
            .await
            .with_context(|| format!("Failed to query CC mode on GPU {}", device.bus_id))?;
        results.push(DeviceModeInfo::new(device, mode, "reset"));
    }
    Ok(results)
}

/// `get-cc-mode`
pub async fn get_cc_mode(
    discovery: &DeviceDiscovery,
    applier: &ModeApplier,
    selector: &DeviceSelector,
    output_format: OutputFormat,
) -> Result<()> {
    let modes = query_modes(discovery, applier, selector).await?;
    OutputFormatter::new(output_format).print_list(&modes)
}

/// `set-cc-mode`
pub async fn set_cc_mode(
    discovery: &DeviceDiscovery,
    applier: &ModeApplier,
    selector: &DeviceSelector,
    mode: CcMode,
    output_format: OutputFormat,
) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);
    let results = apply_mode(discovery, applier, selector, mode).await?;
    formatter.print_list(&results)?;
    formatter.print_success(&format!("CC mode '{}' set on {} GPU(s)", mode, results.len()));
    Ok(())
}

/// `reset`
pub async fn reset(
    discovery: &DeviceDiscovery,
    applier: &ModeApplier,
    selector: &DeviceSelector,
    output_format: OutputFormat,
) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);
    let results = reset_devices(discovery, applier, selector).await?;
    formatter.print_list(&results)?;
    formatter.print_success(&format!("Reset {} GPU(s)", results.len()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccm_adapter_gpu::mock::{MockModeTool, MockPciBus, ToolCall};
    use std::sync::Arc;

    const GPU0: &str = "0000:41:00.0";
    const GPU1: &str = "0000:c1:00.0";

    fn setup(tool: MockModeTool) -> (DeviceDiscovery, ModeApplier, Arc<MockModeTool>) {
        let bus = Arc::new(MockPciBus::new(vec![
            Device::new(GPU0, 0x10de, 0x030200, 0x2331),
            Device::new(GPU1, 0x10de, 0x030200, 0x2331),
            // Not CC capable
            Device::new("0000:01:00.0", 0x10de, 0x030000, 0x1eb8),
        ]));
        let tool = Arc::new(tool);
        (
            DeviceDiscovery::new(bus.clone(), vec![0x2331]),
            ModeApplier::new(bus, tool.clone()),
            tool,
        )
    }

    fn all() -> DeviceSelector {
        DeviceSelector {
            all: true,
            device_id: None,
        }
    }

    fn one(bus_id: &str) -> DeviceSelector {
        DeviceSelector {
            all: false,
            device_id: Some(bus_id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_query_all() {
        let (discovery, applier, _) = setup(
            MockModeTool::new()
                .with_mode(GPU0, CcMode::On)
                .with_mode(GPU1, CcMode::Devtools),
        );

        let modes = query_modes(&discovery, &applier, &all()).await.unwrap();
        let summary: Vec<_> = modes.iter().map(|m| (m.bus_id.as_str(), m.mode.as_str())).collect();
        assert_eq!(summary, vec![(GPU0, "on"), (GPU1, "devtools")]);
        assert_eq!(modes[0].device_id, "0x2331");
    }

    #[tokio::test]
    async fn test_set_single_device() {
        let (discovery, applier, tool) = setup(
            MockModeTool::new()
                .with_mode(GPU0, CcMode::Off)
                .with_mode(GPU1, CcMode::Off),
        );

        let results = apply_mode(&discovery, &applier, &one(GPU1), CcMode::On)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action, "switched from off");
        assert_eq!(tool.mode(GPU0), Some(CcMode::Off));
        assert_eq!(tool.mode(GPU1), Some(CcMode::On));
    }

    #[tokio::test]
    async fn test_set_stops_at_first_failure() {
        let (discovery, applier, tool) = setup(
            MockModeTool::new()
                .with_mode(GPU0, CcMode::Off)
                .with_mode(GPU1, CcMode::Off)
                .with_set_failure(GPU0),
        );

        let err = apply_mode(&discovery, &applier, &all(), CcMode::On)
            .await
            .unwrap_err();
        assert!(err.to_string().contains(GPU0));
        assert!(!tool
            .calls()
            .contains(&ToolCall::SetAndReset(GPU1.to_string(), CcMode::On)));
    }

    #[tokio::test]
    async fn test_unknown_device_is_rejected() {
        let (discovery, applier, tool) = setup(MockModeTool::new());

        let result = query_modes(&discovery, &applier, &one("0000:01:00.0")).await;
        assert!(result.is_err());
        assert!(tool.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reset() {
        let (discovery, applier, tool) = setup(MockModeTool::new().with_mode(GPU0, CcMode::On));

        let results = reset_devices(&discovery, &applier, &one(GPU0)).await.unwrap();
        assert_eq!(results[0].mode, "on");
        assert_eq!(tool.calls()[0], ToolCall::Reset(GPU0.to_string()));
    }

    #[test]
    fn test_text_line() {
        let device = Device::new(GPU0, 0x10de, 0x030200, 0x2331);
        assert_eq!(
            DeviceModeInfo::new(&device, CcMode::On, "").text_line(),
            "0000:41:00.0 on"
        );
        assert_eq!(
            DeviceModeInfo::new(&device, CcMode::On, "reset").text_line(),
            "0000:41:00.0 on (reset)"
        );
    }
}
