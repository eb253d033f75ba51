//! CC mode value space
//!
//! `CcMode` is the closed set of modes a device can be driven into. The
//! target label on a node may also be empty, which means "use the configured
//! default"; that case is represented as `Option<CcMode>` by
//! [`CcMode::parse_target`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Confidential-computing mode of an accelerator device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CcMode {
    /// Confidential computing enabled
    On,
    /// Confidential computing disabled
    Off,
    /// Confidential computing enabled with developer tooling access
    Devtools,
}

impl CcMode {
    /// All valid modes
    pub const ALL: [CcMode; 3] = [CcMode::On, CcMode::Off, CcMode::Devtools];

    /// Label/tool representation of this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            CcMode::On => "on",
            CcMode::Off => "off",
            CcMode::Devtools => "devtools",
        }
    }

    /// Parse a target label value. Empty (after trimming) means unset.
    pub fn parse_target(value: &str) -> Result<Option<CcMode>> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(None);
        }
        value.parse().map(Some)
    }
}

impl fmt::Display for CcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CcMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on" => Ok(CcMode::On),
            "off" => Ok(CcMode::Off),
            "devtools" => Ok(CcMode::Devtools),
            other => Err(Error::parse(format!(
                "unrecognized CC mode '{}' (expected one of: on, off, devtools)",
                other
            ))),
        }
    }
}

/// Outcome published to the status label after a reconciliation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeStatus {
    /// Every device was verified in this mode
    Applied(CcMode),
    /// The cycle aborted on a device failure
    Failed,
}

impl ModeStatus {
    /// Label value for the status label
    pub fn as_label_value(&self) -> &'static str {
        match self {
            ModeStatus::Applied(mode) => mode.as_str(),
            ModeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ModeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("on".parse::<CcMode>().unwrap(), CcMode::On);
        assert_eq!("off".parse::<CcMode>().unwrap(), CcMode::Off);
        assert_eq!("devtools".parse::<CcMode>().unwrap(), CcMode::Devtools);

        let err = "ON".parse::<CcMode>().unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        assert!("".parse::<CcMode>().is_err());
        assert!("failed".parse::<CcMode>().is_err());
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(CcMode::parse_target("").unwrap(), None);
        assert_eq!(CcMode::parse_target("  ").unwrap(), None);
        assert_eq!(CcMode::parse_target("devtools").unwrap(), Some(CcMode::Devtools));
        assert!(CcMode::parse_target("enabled").is_err());
    }

    #[test]
    fn test_mode_display_round_trip() {
        for mode in CcMode::ALL {
            assert_eq!(mode.to_string().parse::<CcMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_status_label_values() {
        assert_eq!(ModeStatus::Applied(CcMode::Off).as_label_value(), "off");
        assert_eq!(ModeStatus::Applied(CcMode::Devtools).to_string(), "devtools");
        assert_eq!(ModeStatus::Failed.as_label_value(), "failed");
    }

    #[test]
    fn test_mode_serde() {
        let yaml = serde_yaml::to_string(&CcMode::Devtools).unwrap();
        assert_eq!(yaml.trim(), "devtools");
        let mode: CcMode = serde_json::from_str("\"on\"").unwrap();
        assert_eq!(mode, CcMode::On);
    }
}
