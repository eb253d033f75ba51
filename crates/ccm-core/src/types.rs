//! Device identity and eligibility rules

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// PCI vendor id of the accelerator vendor
pub const ACCELERATOR_VENDOR_ID: u16 = 0x10de;

/// PCI class code of a VGA-compatible display controller
pub const CLASS_VGA_CONTROLLER: u32 = 0x030000;

/// PCI class code of a 3D controller
pub const CLASS_3D_CONTROLLER: u32 = 0x030200;

/// Class codes accepted as accelerators
pub const ACCEPTED_CLASS_CODES: [u32; 2] = [CLASS_VGA_CONTROLLER, CLASS_3D_CONTROLLER];

/// A PCI device on this node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    /// Bus address (e.g. "0000:41:00.0")
    pub bus_id: String,

    /// PCI vendor id
    pub vendor_id: u16,

    /// PCI class code (24 bits)
    pub class_code: u32,

    /// PCI device id
    pub device_id: u16,
}

impl Device {
    /// Create a new device
    pub fn new(bus_id: impl Into<String>, vendor_id: u16, class_code: u32, device_id: u16) -> Self {
        Self {
            bus_id: bus_id.into(),
            vendor_id,
            class_code,
            device_id,
        }
    }

    /// Whether the device is an accelerator from the supported vendor
    pub fn is_eligible(&self) -> bool {
        self.vendor_id == ACCELERATOR_VENDOR_ID && ACCEPTED_CLASS_CODES.contains(&self.class_code)
    }

    /// Whether the device id is in the CC-capable allow-list
    pub fn is_capable(&self, allow_list: &[u16]) -> bool {
        allow_list.contains(&self.device_id)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:04x}:{:04x}]", self.bus_id, self.vendor_id, self.device_id)
    }
}

/// Parse a single hexadecimal id, with or without a `0x` prefix
pub fn parse_hex_id(value: &str) -> Result<u32> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    u32::from_str_radix(digits, 16)
        .map_err(|e| Error::parse(format!("invalid hexadecimal id '{}': {}", value, e)))
}

/// Parse the comma-separated CC-capable device id allow-list.
///
/// The list must contain at least one id; blank entries are ignored.
pub fn parse_device_id_list(value: &str) -> Result<Vec<u16>> {
    let mut ids = Vec::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let id = parse_hex_id(entry)
            .map_err(|e| Error::config(format!("CC capable device id list: {}", e)))?;
        let id = u16::try_from(id)
            .map_err(|_| Error::config(format!("device id '{}' does not fit in 16 bits", entry)))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    if ids.is_empty() {
        return Err(Error::config("CC capable device id list must not be empty"));
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_eligibility() {
        let gpu = Device::new("0000:41:00.0", 0x10de, CLASS_3D_CONTROLLER, 0x2331);
        assert!(gpu.is_eligible());

        let display = Device::new("0000:01:00.0", 0x10de, CLASS_VGA_CONTROLLER, 0x2684);
        assert!(display.is_eligible());

        let audio = Device::new("0000:41:00.1", 0x10de, 0x040300, 0x22ba);
        assert!(!audio.is_eligible());

        let other_vendor = Device::new("0000:02:00.0", 0x1002, CLASS_3D_CONTROLLER, 0x740f);
        assert!(!other_vendor.is_eligible());
    }

    #[test]
    fn test_device_capability() {
        let gpu = Device::new("0000:41:00.0", 0x10de, CLASS_3D_CONTROLLER, 0x2331);
        assert!(gpu.is_capable(&[0x2330, 0x2331]));
        assert!(!gpu.is_capable(&[0x2330]));
        assert!(!gpu.is_capable(&[]));
    }

    #[test]
    fn test_parse_device_id_list() {
        assert_eq!(parse_device_id_list("0x2330,0x2331").unwrap(), vec![0x2330, 0x2331]);
        assert_eq!(parse_device_id_list(" 2330 , 0X2322,").unwrap(), vec![0x2330, 0x2322]);
        assert_eq!(parse_device_id_list("0x2330,0x2330").unwrap(), vec![0x2330]);

        assert!(matches!(parse_device_id_list(""), Err(Error::Config(_))));
        assert!(matches!(parse_device_id_list(" , "), Err(Error::Config(_))));
        assert!(matches!(parse_device_id_list("0xzz"), Err(Error::Config(_))));
        assert!(matches!(parse_device_id_list("0x12345"), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0x10de").unwrap(), 0x10de);
        assert_eq!(parse_hex_id("0x030200\n").unwrap(), 0x030200);
        assert!(parse_hex_id("nope").is_err());
    }

    #[test]
    fn test_device_display() {
        let gpu = Device::new("0000:41:00.0", 0x10de, CLASS_3D_CONTROLLER, 0x2331);
        assert_eq!(gpu.to_string(), "0000:41:00.0 [10de:2331]");
    }
}
