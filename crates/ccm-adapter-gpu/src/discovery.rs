//! Accelerator discovery from the PCI device tree

use ccm_core::{parse_hex_id, Device, Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Access to the host PCI bus
pub trait PciBus: Send + Sync {
    /// Enumerate every PCI function on the bus
    fn scan(&self) -> Result<Vec<Device>>;

    /// Detach the device from its bound driver.
    ///
    /// Returns the name of the driver that was unbound, or `None` when
    /// nothing was bound.
    fn unbind(&self, device: &Device) -> Result<Option<String>>;
}

/// PCI bus backed by sysfs (`<root>/bus/pci/devices`)
#[derive(Debug, Clone)]
pub struct SysfsPciBus {
    root: PathBuf,
}

impl SysfsPciBus {
    /// Create a bus rooted at the given sysfs mount point
    pub fn new(sysfs_root: impl AsRef<Path>) -> Self {
        Self {
            root: sysfs_root.as_ref().to_path_buf(),
        }
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join("bus").join("pci").join("devices")
    }

    fn read_id(dir: &Path, attribute: &str) -> Result<u32> {
        let raw = std::fs::read_to_string(dir.join(attribute))?;
        parse_hex_id(&raw)
    }

    fn read_device(dir: &Path, bus_id: &str) -> Result<Device> {
        let vendor_id = Self::read_id(dir, "vendor")?;
        let class_code = Self::read_id(dir, "class")?;
        let device_id = Self::read_id(dir, "device")?;

        let vendor_id = u16::try_from(vendor_id)
            .map_err(|_| Error::parse(format!("vendor id {:#x} out of range", vendor_id)))?;
        let device_id = u16::try_from(device_id)
            .map_err(|_| Error::parse(format!("device id {:#x} out of range", device_id)))?;

        Ok(Device::new(bus_id, vendor_id, class_code, device_id))
    }
}

impl PciBus for SysfsPciBus {
    fn scan(&self) -> Result<Vec<Device>> {
        let dir = self.devices_dir();
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            Error::apply(format!("failed to read PCI device tree {}: {}", dir.display(), e))
        })?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry?;
            let bus_id = entry.file_name().to_string_lossy().to_string();
            match Self::read_device(&entry.path(), &bus_id) {
                Ok(device) => devices.push(device),
                Err(e) => debug!("Skipping PCI entry {}: {}", bus_id, e),
            }
        }

        Ok(devices)
    }

    fn unbind(&self, device: &Device) -> Result<Option<String>> {
        let driver_dir = self.devices_dir().join(&device.bus_id).join("driver");
        if !driver_dir.exists() {
            return Ok(None);
        }

        let driver = std::fs::read_link(&driver_dir)
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        std::fs::write(driver_dir.join("unbind"), &device.bus_id).map_err(|e| {
            Error::apply(format!(
                "failed to unbind {} from driver {}: {}",
                device.bus_id, driver, e
            ))
        })?;

        Ok(Some(driver))
    }
}

/// Finds the devices that take part in reconciliation
#[derive(Clone)]
pub struct DeviceDiscovery {
    bus: Arc<dyn PciBus>,
    capable_device_ids: Vec<u16>,
}

impl DeviceDiscovery {
    /// Create a discovery over `bus` with the given CC-capable allow-list
    pub fn new(bus: Arc<dyn PciBus>, capable_device_ids: Vec<u16>) -> Self {
        Self {
            bus,
            capable_device_ids,
        }
    }

    /// Discover eligible and CC-capable devices, sorted by bus address
    pub fn discover(&self) -> Result<Vec<Device>> {
        if self.capable_device_ids.is_empty() {
            return Err(Error::config("CC capable device id list must not be empty"));
        }

        let mut eligible: BTreeMap<String, Device> = BTreeMap::new();
        for device in self.bus.scan()? {
            if device.is_eligible() {
                eligible.entry(device.bus_id.clone()).or_insert(device);
            }
        }

        let mut devices = Vec::with_capacity(eligible.len());
        for device in eligible.into_values() {
            if device.is_capable(&self.capable_device_ids) {
                info!("Found CC-capable GPU: {}", device);
                devices.push(device);
            } else {
                warn!("GPU {} is not in the CC capable device list, ignoring", device);
            }
        }

        Ok(devices)
    }

    /// Look up one discovered device by bus address
    pub fn find(&self, bus_id: &str) -> Result<Device> {
        self.discover()?
            .into_iter()
            .find(|d| d.bus_id.eq_ignore_ascii_case(bus_id))
            .ok_or_else(|| Error::config(format!("no CC-capable GPU at bus address {}", bus_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPciBus;
    use ccm_core::types::{CLASS_3D_CONTROLLER, CLASS_VGA_CONTROLLER};
    use tempfile::TempDir;

    fn write_pci_device(root: &Path, bus_id: &str, vendor: &str, class: &str, device: &str) -> PathBuf {
        let dir = root.join("bus/pci/devices").join(bus_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("vendor"), format!("{}\n", vendor)).unwrap();
        std::fs::write(dir.join("class"), format!("{}\n", class)).unwrap();
        std::fs::write(dir.join("device"), format!("{}\n", device)).unwrap();
        dir
    }

    #[test]
    fn test_sysfs_scan() {
        let temp_dir = TempDir::new().unwrap();
        write_pci_device(temp_dir.path(), "0000:41:00.0", "0x10de", "0x030200", "0x2331");
        write_pci_device(temp_dir.path(), "0000:00:1f.3", "0x8086", "0x040380", "0x7a50");
        // Incomplete entry is skipped
        std::fs::create_dir_all(temp_dir.path().join("bus/pci/devices/0000:00:00.0")).unwrap();

        let bus = SysfsPciBus::new(temp_dir.path());
        let mut devices = bus.scan().unwrap();
        devices.sort_by(|a, b| a.bus_id.cmp(&b.bus_id));

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1], Device::new("0000:41:00.0", 0x10de, 0x030200, 0x2331));
    }

    #[test]
    fn test_sysfs_scan_missing_tree() {
        let temp_dir = TempDir::new().unwrap();
        let bus = SysfsPciBus::new(temp_dir.path());
        assert!(matches!(bus.scan(), Err(Error::Apply(_))));
    }

    #[test]
    fn test_sysfs_unbind() {
        let temp_dir = TempDir::new().unwrap();
        let dir = write_pci_device(temp_dir.path(), "0000:41:00.0", "0x10de", "0x030200", "0x2331");
        let device = Device::new("0000:41:00.0", 0x10de, 0x030200, 0x2331);
        let bus = SysfsPciBus::new(temp_dir.path());

        // Nothing bound is a no-op
        assert_eq!(bus.unbind(&device).unwrap(), None);

        std::fs::create_dir_all(dir.join("driver")).unwrap();
        std::fs::write(dir.join("driver/unbind"), "").unwrap();
        assert!(bus.unbind(&device).unwrap().is_some());
        assert_eq!(
            std::fs::read_to_string(dir.join("driver/unbind")).unwrap(),
            "0000:41:00.0"
        );
    }

    #[test]
    fn test_discovery_filters_and_sorts() {
        let bus = MockPciBus::new(vec![
            Device::new("0000:c1:00.0", 0x10de, CLASS_3D_CONTROLLER, 0x2331),
            Device::new("0000:41:00.0", 0x10de, CLASS_3D_CONTROLLER, 0x2331),
            Device::new("0000:41:00.1", 0x10de, 0x040300, 0x22ba),
            Device::new("0000:01:00.0", 0x10de, CLASS_VGA_CONTROLLER, 0x2684),
            Device::new("0000:02:00.0", 0x1af4, CLASS_3D_CONTROLLER, 0x2331),
        ]);
        let discovery = DeviceDiscovery::new(Arc::new(bus), vec![0x2331]);

        let devices = discovery.discover().unwrap();
        let ids: Vec<&str> = devices.iter().map(|d| d.bus_id.as_str()).collect();
        assert_eq!(ids, vec!["0000:41:00.0", "0000:c1:00.0"]);
    }

    #[test]
    fn test_discovery_deduplicates() {
        let gpu = Device::new("0000:41:00.0", 0x10de, CLASS_3D_CONTROLLER, 0x2331);
        let bus = MockPciBus::new(vec![gpu.clone(), gpu.clone()]);
        let discovery = DeviceDiscovery::new(Arc::new(bus), vec![0x2331]);

        assert_eq!(discovery.discover().unwrap(), vec![gpu.clone()]);
        assert_eq!(discovery.discover().unwrap(), vec![gpu]);
    }

    #[test]
    fn test_discovery_requires_allow_list() {
        let bus = MockPciBus::new(Vec::new());
        let discovery = DeviceDiscovery::new(Arc::new(bus), Vec::new());
        assert!(matches!(discovery.discover(), Err(Error::Config(_))));
    }

    #[test]
    fn test_find_device() {
        let bus = MockPciBus::new(vec![Device::new(
            "0000:41:00.0",
            0x10de,
            CLASS_3D_CONTROLLER,
            0x2331,
        )]);
        let discovery = DeviceDiscovery::new(Arc::new(bus), vec![0x2331]);

        assert!(discovery.find("0000:41:00.0").is_ok());
        assert!(discovery.find("0000:42:00.0").is_err());
    }
}
