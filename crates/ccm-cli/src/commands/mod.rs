//! Command implementations for cc-manager

pub mod mode;

use anyhow::{bail, Context, Result};
use ccm_adapter_gpu::DeviceDiscovery;
use ccm_core::Device;
use clap::Args;

/// Which devices a command operates on
#[derive(Debug, Clone, Args)]
#[group(required = true, multiple = false)]
pub struct DeviceSelector {
    /// Operate on every CC capable GPU
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Operate on the GPU at this PCI address
    #[arg(long = "device-id", value_name = "BDF")]
    pub device_id: Option<String>,
}

impl DeviceSelector {
    /// Resolve the selection against the discovered devices
    pub fn select(&self, discovery: &DeviceDiscovery) -> Result<Vec<Device>> {
        if let Some(ref bus_id) = self.device_id {
            let device = discovery
                .find(bus_id)
                .with_context(|| format!("GPU {} is not a CC capable device", bus_id))?;
            return Ok(vec![device]);
        }

        if !self.all {
            bail!("either --all or --device-id must be given");
        }
        discovery.discover().context("Failed to discover GPUs")
    }
}
