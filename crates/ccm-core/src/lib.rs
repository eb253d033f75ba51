//! # ccm-core
//!
//! Core types, traits, and utilities for the confidential-computing (CC)
//! mode manager.
//!
//! This crate provides the foundational data structures and interfaces that
//! are shared across the other crates. It includes:
//!
//! - The CC mode value space and the reconciliation status published back
//!   to the node
//! - The node label schema, including the dependent component deployment
//!   labels and their paused/resumed encoding
//! - Device identity and eligibility rules
//! - The node metadata capability consumed by the agent
//! - Error handling types and utilities

pub mod error;
pub mod labels;
pub mod mode;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use error::{Error, Result};
pub use labels::{Component, ComponentState, CC_MODE_LABEL, CC_MODE_STATE_LABEL, PAUSED_MARKER};
pub use mode::{CcMode, ModeStatus};
pub use traits::{NodeEvent, NodeMetadata, NodeSnapshot};
pub use types::{parse_device_id_list, parse_hex_id, Device};

/// Current version of the CC mode manager
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
