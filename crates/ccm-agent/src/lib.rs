//! # ccm-agent
//!
//! Node agent (k8s-cc-manager) for the CC mode manager.
//!
//! The agent keeps the confidential-computing mode of the GPUs on one node in
//! sync with the `nvidia.com/cc.mode` node label. It evicts the GPU operator
//! components that hold the devices before switching modes, verifies the
//! result, reports it in `nvidia.com/cc.mode.state` and restores the
//! components afterwards.

pub mod agent;
pub mod config;
pub mod kube;
pub mod kubeconfig;
pub mod services;
pub mod watcher;

#[cfg(any(feature = "mock", test))]
pub mod mock;

// Re-export commonly used types
pub use agent::{Agent, AgentBuilder};
pub use config::{AgentConfig, LoggingConfig};
pub use kube::KubeClient;
pub use services::{CycleOutcome, ModeReconciler};
pub use watcher::LabelWatcher;

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Core(#[from] ccm_core::Error),

    #[error("Config loading error: {0}")]
    ConfigLoad(#[from] ::config::ConfigError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    #[error("Label subscription failed: {0}")]
    Subscription(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Initialize logging and build an agent from `config`
pub async fn init_agent(config: &AgentConfig) -> Result<Agent> {
    init_logging(&config.logging)?;

    AgentBuilder::new().with_config(config.clone()).build().await
}

/// Initialize logging and tracing
pub fn init_logging(logging_config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    let result = match logging_config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };

    result.map_err(|e| AgentError::Config(format!("Failed to initialize logging: {}", e)))
}
