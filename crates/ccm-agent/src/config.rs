//! Configuration management for the CC mode agent
//!
//! Sources, lowest precedence first: built-in defaults, an optional YAML
//! file, the process environment and finally command-line overrides applied
//! by the binary. Environment keys are unprefixed so the variable names used
//! by existing deployments (`NODE_NAME`, `CC_CAPABLE_DEVICE_IDS`, ...) keep
//! working.

use crate::{AgentError, Result};
use ccm_adapter_gpu::GpuAdapterConfig;
use ccm_core::{parse_device_id_list, CcMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "CC_MANAGER_CONFIG";

/// Complete configuration for the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name of the node this agent manages
    pub node_name: String,

    /// Comma-separated CC-capable PCI device ids
    pub cc_capable_device_ids: String,

    /// Mode applied when the node label is absent or empty
    pub default_cc_mode: String,

    /// Evict GPU operator components before switching modes
    pub evict_operator_components: bool,

    /// Namespace the GPU operator components run in
    pub operator_namespace: String,

    /// Readiness marker created after the initial apply
    pub cc_readiness_file: PathBuf,

    /// Time allowed for a component's pods to leave the node (seconds)
    pub eviction_timeout_seconds: u64,

    /// Interval between pod checks while waiting for eviction (seconds)
    pub eviction_poll_interval_seconds: u64,

    /// GPU admin tool executable
    pub gpu_admin_tool: PathBuf,

    /// Root of the sysfs tree
    pub sysfs_root: PathBuf,

    /// Explicit API server URL (e.g. `kubectl proxy`); in-cluster when unset
    pub kube_api_server: Option<String>,

    /// Kubeconfig file used instead of the in-cluster service account
    pub kubeconfig: Option<PathBuf>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,

    /// Show thread IDs in logs
    pub show_thread_ids: bool,

    /// Show line numbers in logs
    pub show_line_numbers: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            cc_capable_device_ids: String::new(),
            default_cc_mode: String::new(),
            evict_operator_components: true,
            operator_namespace: "gpu-operator".to_string(),
            cc_readiness_file: PathBuf::from("/run/nvidia/validations/.cc-manager-ctr-ready"),
            eviction_timeout_seconds: 300,
            eviction_poll_interval_seconds: 2,
            gpu_admin_tool: PathBuf::from(ccm_adapter_gpu::config::DEFAULT_TOOL_PATH),
            sysfs_root: PathBuf::from(ccm_adapter_gpu::config::DEFAULT_SYSFS_ROOT),
            kube_api_server: None,
            kubeconfig: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from defaults, an optional file and the process
    /// environment.
    ///
    /// An explicit `path` must exist; the file named by `CC_MANAGER_CONFIG`
    /// is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`AgentConfig::load`], reading environment keys from `env`
    /// instead of the process environment when given
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        } else if let Ok(config_path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        }

        builder = builder.add_source(config::Environment::default().source(env));

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to a YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(AgentError::Config(
                "NODE_NAME must be set for k8s-cc-manager".to_string(),
            ));
        }

        if self.cc_capable_device_ids.trim().is_empty() {
            return Err(AgentError::Config(
                "CC_CAPABLE_DEVICE_IDS must be set for k8s-cc-manager".to_string(),
            ));
        }
        self.capable_device_ids()?;
        self.default_mode()?;

        if self.operator_namespace.trim().is_empty() {
            return Err(AgentError::Config("Operator namespace cannot be empty".to_string()));
        }

        if self.eviction_timeout_seconds == 0 {
            return Err(AgentError::Config(
                "Eviction timeout must be greater than 0".to_string(),
            ));
        }

        if self.eviction_poll_interval_seconds == 0 {
            return Err(AgentError::Config(
                "Eviction poll interval must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(AgentError::Config(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            _ => {
                return Err(AgentError::Config(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Parsed CC-capable device id allow-list
    pub fn capable_device_ids(&self) -> Result<Vec<u16>> {
        Ok(parse_device_id_list(&self.cc_capable_device_ids)?)
    }

    /// Parsed default mode; `None` when no default is configured
    pub fn default_mode(&self) -> Result<Option<CcMode>> {
        CcMode::parse_target(&self.default_cc_mode)
            .map_err(|e| AgentError::Config(format!("Invalid default CC mode: {}", e)))
    }

    /// Eviction wait budget per component
    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_secs(self.eviction_timeout_seconds)
    }

    /// Interval between eviction checks
    pub fn eviction_poll_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_poll_interval_seconds)
    }

    /// Kubeconfig file to use, ignoring an empty `KUBECONFIG`
    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.kubeconfig
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    /// Hardware-side configuration derived from this one
    pub fn gpu_config(&self) -> Result<GpuAdapterConfig> {
        Ok(GpuAdapterConfig::new(self.capable_device_ids()?)
            .with_tool_path(&self.gpu_admin_tool)
            .with_sysfs_root(&self.sysfs_root))
    }
}
