//! # ccm-adapter-gpu
//!
//! Hardware-facing side of the CC mode manager.
//!
//! This crate provides:
//! - Discovery of CC-capable accelerators from the PCI device tree
//! - An adapter around the external GPU admin tool that queries and switches
//!   the CC mode of a device
//! - The per-device mode applier (query, unbind, switch and reset, verify)
//!
//! ## Example
//!
//! ```rust,no_run
//! use ccm_adapter_gpu::{DeviceDiscovery, GpuAdapterConfig, GpuAdminTool, ModeApplier, SysfsPciBus};
//! use ccm_core::CcMode;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GpuAdapterConfig::new(vec![0x2330, 0x2331]);
//!     let bus = Arc::new(SysfsPciBus::new(&config.sysfs_root));
//!     let tool = Arc::new(GpuAdminTool::new(&config.tool_path));
//!
//!     let discovery = DeviceDiscovery::new(bus.clone(), config.capable_device_ids.clone());
//!     let applier = ModeApplier::new(bus, tool);
//!
//!     for device in discovery.discover()? {
//!         applier.apply(&device, CcMode::On).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod applier;
pub mod config;
pub mod discovery;
pub mod tool;

// Mock implementation for testing
#[cfg(any(feature = "mock", test))]
pub mod mock;

// Re-export main types
pub use applier::{ApplyOutcome, ModeApplier};
pub use config::GpuAdapterConfig;
pub use discovery::{DeviceDiscovery, PciBus, SysfsPciBus};
pub use tool::{parse_query_output, GpuAdminTool, ModeTool};
