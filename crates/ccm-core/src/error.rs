//! Error handling for the CC mode manager
//!
//! One taxonomy shared by every crate. Failures are classified once, at the
//! boundary where they are detected, and the reconciliation logic only
//! inspects the variant.

use crate::CcMode;
use std::time::Duration;

/// Result type alias for CC mode manager operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the CC mode manager
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid required configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unrecognized or unparseable hardware tool output
    #[error("Parse error: {0}")]
    Parse(String),

    /// Post-switch verification disagrees with the desired mode
    #[error("CC mode verification failed on {device}: expected '{expected}', got '{actual}'")]
    AssertionMismatch {
        device: String,
        expected: CcMode,
        actual: CcMode,
    },

    /// A dependent workload did not vacate the node within budget
    #[error("Timed out after {timeout:?} waiting for {component} pods to leave the node")]
    EvictionTimeout { component: String, timeout: Duration },

    /// The hardware tool or a sysfs operation failed
    #[error("Apply error: {0}")]
    Apply(String),

    /// The cluster metadata store rejected or failed a request
    #[error("Cluster API error: {0}")]
    Api(String),

    /// The cluster API reported a resource version that is no longer available
    #[error("Resource version expired: {0}")]
    Gone(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create an apply error
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply(msg.into())
    }

    /// Create a cluster API error
    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    /// Check if this error was raised while driving a device
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            Error::Parse(_) | Error::Apply(_) | Error::AssertionMismatch { .. }
        )
    }

    /// Check if this error is an eviction timeout
    pub fn is_eviction_timeout(&self) -> bool {
        matches!(self, Error::EvictionTimeout { .. })
    }

    /// Check if this error is worth retrying against the cluster API
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Api(_) | Error::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::parse("bad token").is_device_failure());
        assert!(Error::apply("exit 1").is_device_failure());
        assert!(Error::AssertionMismatch {
            device: "0000:41:00.0".to_string(),
            expected: CcMode::On,
            actual: CcMode::Off,
        }
        .is_device_failure());

        let timeout = Error::EvictionTimeout {
            component: "nvidia-vfio-manager".to_string(),
            timeout: Duration::from_secs(300),
        };
        assert!(timeout.is_eviction_timeout());
        assert!(!timeout.is_device_failure());

        assert!(!Error::config("missing").is_device_failure());
        assert!(Error::api("503").is_retryable());
        assert!(!Error::config("missing").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let error = Error::AssertionMismatch {
            device: "0000:41:00.0".to_string(),
            expected: CcMode::On,
            actual: CcMode::Devtools,
        };
        assert_eq!(
            error.to_string(),
            "CC mode verification failed on 0000:41:00.0: expected 'on', got 'devtools'"
        );

        let error = Error::config("NODE_NAME must be set");
        assert_eq!(error.to_string(), "Configuration error: NODE_NAME must be set");
    }
}
