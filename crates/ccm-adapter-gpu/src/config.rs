//! GPU adapter configuration

use ccm_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default location of the GPU admin tool
pub const DEFAULT_TOOL_PATH: &str = "/usr/local/bin/nvidia_gpu_tools";

/// Default sysfs mount point
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Hardware-side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuAdapterConfig {
    /// GPU admin tool executable
    pub tool_path: PathBuf,

    /// Root of the sysfs tree to scan
    pub sysfs_root: PathBuf,

    /// Device ids that support CC mode
    pub capable_device_ids: Vec<u16>,
}

impl GpuAdapterConfig {
    /// Create a configuration with default paths
    pub fn new(capable_device_ids: Vec<u16>) -> Self {
        Self {
            tool_path: PathBuf::from(DEFAULT_TOOL_PATH),
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            capable_device_ids,
        }
    }

    /// Set the tool path
    pub fn with_tool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tool_path = path.into();
        self
    }

    /// Set the sysfs root
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.capable_device_ids.is_empty() {
            return Err(Error::config("CC capable device id list must not be empty"));
        }
        if self.tool_path.as_os_str().is_empty() {
            return Err(Error::config("GPU admin tool path must not be empty"));
        }
        Ok(())
    }
}
