//! Mock PCI bus and mode tool for testing

use crate::discovery::PciBus;
use crate::tool::{parse_query_output, ModeTool};
use async_trait::async_trait;
use ccm_core::{CcMode, Device, Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory PCI bus
#[derive(Debug, Default)]
pub struct MockPciBus {
    devices: Vec<Device>,
    drivers: Mutex<HashMap<String, String>>,
    unbind_failures: HashSet<String>,
    unbound: Mutex<Vec<String>>,
}

impl MockPciBus {
    /// Create a bus exposing `devices`
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices,
            ..Default::default()
        }
    }

    /// Bind `driver` to the device at `bus_id`
    pub fn with_driver(self, bus_id: &str, driver: &str) -> Self {
        lock(&self.drivers).insert(bus_id.to_string(), driver.to_string());
        self
    }

    /// Make unbinding the device at `bus_id` fail
    pub fn with_unbind_failure(mut self, bus_id: &str) -> Self {
        self.unbind_failures.insert(bus_id.to_string());
        self
    }

    /// Bus addresses unbound so far, in order
    pub fn unbound(&self) -> Vec<String> {
        lock(&self.unbound).clone()
    }
}

impl PciBus for MockPciBus {
    fn scan(&self) -> Result<Vec<Device>> {
        Ok(self.devices.clone())
    }

    fn unbind(&self, device: &Device) -> Result<Option<String>> {
        if self.unbind_failures.contains(&device.bus_id) {
            return Err(Error::apply(format!("mock unbind failure on {}", device.bus_id)));
        }
        let driver = lock(&self.drivers).remove(&device.bus_id);
        if driver.is_some() {
            lock(&self.unbound).push(device.bus_id.clone());
        }
        Ok(driver)
    }
}

/// A call recorded by [`MockModeTool`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    Query(String),
    SetAndReset(String, CcMode),
    Reset(String),
}

/// Scriptable in-memory mode tool
#[derive(Debug, Default)]
pub struct MockModeTool {
    modes: Mutex<HashMap<String, CcMode>>,
    query_outputs: HashMap<String, String>,
    set_failures: HashSet<String>,
    stuck: HashSet<String>,
    calls: Mutex<Vec<ToolCall>>,
}

impl MockModeTool {
    /// Create a tool with no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial mode of a device
    pub fn with_mode(self, bus_id: &str, mode: CcMode) -> Self {
        self.set_mode(bus_id, mode);
        self
    }

    /// Return raw `output` from queries on a device instead of its mode
    pub fn with_query_output(mut self, bus_id: &str, output: &str) -> Self {
        self.query_outputs.insert(bus_id.to_string(), output.to_string());
        self
    }

    /// Make set-and-reset fail on a device
    pub fn with_set_failure(mut self, bus_id: &str) -> Self {
        self.set_failures.insert(bus_id.to_string());
        self
    }

    /// Accept set-and-reset on a device without changing its mode
    pub fn with_stuck_mode(mut self, bus_id: &str) -> Self {
        self.stuck.insert(bus_id.to_string());
        self
    }

    /// Change a device's mode behind the agent's back
    pub fn set_mode(&self, bus_id: &str, mode: CcMode) {
        lock(&self.modes).insert(bus_id.to_string(), mode);
    }

    /// Current mode of a device
    pub fn mode(&self, bus_id: &str) -> Option<CcMode> {
        lock(&self.modes).get(bus_id).copied()
    }

    /// All recorded calls, in order
    pub fn calls(&self) -> Vec<ToolCall> {
        lock(&self.calls).clone()
    }

    /// Number of calls that could change device state
    pub fn mutation_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| !matches!(c, ToolCall::Query(_)))
            .count()
    }
}

#[async_trait]
impl ModeTool for MockModeTool {
    async fn query_mode(&self, device: &Device) -> Result<CcMode> {
        lock(&self.calls).push(ToolCall::Query(device.bus_id.clone()));

        if let Some(output) = self.query_outputs.get(&device.bus_id) {
            return parse_query_output(output);
        }

        let mode = self
            .mode(&device.bus_id)
            .ok_or_else(|| Error::apply(format!("mock GPU {} not found", device.bus_id)))?;
        debug!("Mock GPU {} reports CC mode {}", device.bus_id, mode);
        Ok(mode)
    }

    async fn set_mode_and_reset(&self, device: &Device, mode: CcMode) -> Result<()> {
        lock(&self.calls).push(ToolCall::SetAndReset(device.bus_id.clone(), mode));

        if self.set_failures.contains(&device.bus_id) {
            return Err(Error::apply(format!("mock set failure on {}", device.bus_id)));
        }
        if !self.stuck.contains(&device.bus_id) {
            self.set_mode(&device.bus_id, mode);
        }
        Ok(())
    }

    async fn reset(&self, device: &Device) -> Result<()> {
        lock(&self.calls).push(ToolCall::Reset(device.bus_id.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_tool_records_calls() {
        let device = Device::new("0000:41:00.0", 0x10de, 0x030200, 0x2331);
        let tool = MockModeTool::new().with_mode(&device.bus_id, CcMode::Off);

        assert_eq!(tool.query_mode(&device).await.unwrap(), CcMode::Off);
        tool.set_mode_and_reset(&device, CcMode::On).await.unwrap();
        tool.reset(&device).await.unwrap();

        assert_eq!(tool.mode(&device.bus_id), Some(CcMode::On));
        assert_eq!(tool.mutation_count(), 2);
        assert_eq!(tool.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_tool_unknown_device() {
        let device = Device::new("0000:41:00.0", 0x10de, 0x030200, 0x2331);
        let tool = MockModeTool::new();
        assert!(tool.query_mode(&device).await.is_err());
    }

    #[test]
    fn test_mock_bus_unbind() {
        let device = Device::new("0000:41:00.0", 0x10de, 0x030200, 0x2331);
        let bus = MockPciBus::new(vec![device.clone()]).with_driver(&device.bus_id, "vfio-pci");

        assert_eq!(bus.unbind(&device).unwrap(), Some("vfio-pci".to_string()));
        assert_eq!(bus.unbind(&device).unwrap(), None);
        assert_eq!(bus.unbound(), vec![device.bus_id]);
    }
}
