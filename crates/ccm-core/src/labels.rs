//! Node label schema for the CC mode manager
//!
//! Three groups of labels live on the node object:
//!
//! - the target label, which carries the desired CC mode
//! - the status label, which reports the last reconciliation outcome
//! - five component deployment labels, which the GPU operator uses to decide
//!   whether its per-node agents should run on this node
//!
//! The deployment labels are freeform strings. While a mode switch is in
//! progress they are temporarily "paused" by adding a marker token, and
//! restored afterwards. Internally a deployment label is modelled as a
//! `(base, paused)` pair and only rendered to the legacy string form at the
//! metadata boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node label carrying the desired CC mode
pub const CC_MODE_LABEL: &str = "nvidia.com/cc.mode";

/// Node label reporting the last reconciliation outcome
pub const CC_MODE_STATE_LABEL: &str = "nvidia.com/cc.mode.state";

/// Marker token for a deployment label paused by a mode switch
pub const PAUSED_MARKER: &str = "paused-for-cc-mode-change";

const PAUSED_SEPARATOR: char = '_';

/// Dependent GPU operator components that must vacate the node before a
/// mode switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    VfioManager,
    VgpuManager,
    SandboxValidator,
    SandboxDevicePlugin,
    VgpuDeviceManager,
}

impl Component {
    /// All managed components, in the order they are processed
    pub const ALL: [Component; 5] = [
        Component::VfioManager,
        Component::VgpuManager,
        Component::SandboxValidator,
        Component::SandboxDevicePlugin,
        Component::VgpuDeviceManager,
    ];

    /// Short component name
    pub fn name(&self) -> &'static str {
        match self {
            Component::VfioManager => "vfio-manager",
            Component::VgpuManager => "vgpu-manager",
            Component::SandboxValidator => "sandbox-validator",
            Component::SandboxDevicePlugin => "sandbox-device-plugin",
            Component::VgpuDeviceManager => "vgpu-device-manager",
        }
    }

    /// Node label controlling deployment of this component
    pub fn label_key(&self) -> &'static str {
        match self {
            Component::VfioManager => "nvidia.com/gpu.deploy.vfio-manager",
            Component::VgpuManager => "nvidia.com/gpu.deploy.vgpu-manager",
            Component::SandboxValidator => "nvidia.com/gpu.deploy.sandbox-validator",
            Component::SandboxDevicePlugin => "nvidia.com/gpu.deploy.sandbox-device-plugin",
            Component::VgpuDeviceManager => "nvidia.com/gpu.deploy.vgpu-device-manager",
        }
    }

    /// Value of the `app` pod label used by this component's pods
    pub fn app_label(&self) -> &'static str {
        match self {
            Component::VfioManager => "nvidia-vfio-manager",
            Component::VgpuManager => "nvidia-vgpu-manager",
            Component::SandboxValidator => "nvidia-sandbox-validator",
            Component::SandboxDevicePlugin => "nvidia-sandbox-device-plugin-daemonset",
            Component::VgpuDeviceManager => "nvidia-vgpu-device-manager",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deployment state of one dependent component on this node
///
/// `base` is the value the operator would see without a mode switch in
/// progress: empty (unmanaged), `"false"` (forced off), `"true"` (on), or an
/// arbitrary pinned string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComponentState {
    base: String,
    paused: bool,
    label: String,
}

impl ComponentState {
    /// Decode a deployment label value
    pub fn from_label(value: &str) -> Self {
        let suffix = format!("{}{}", PAUSED_SEPARATOR, PAUSED_MARKER);

        let (base, paused) = if value == PAUSED_MARKER {
            ("true".to_string(), true)
        } else if let Some(base) = value.strip_suffix(suffix.as_str()) {
            (base.to_string(), true)
        } else if value.contains(PAUSED_MARKER) {
            let stripped = value
                .replace(suffix.as_str(), "")
                .replace(PAUSED_MARKER, "");
            (stripped.trim_matches(PAUSED_SEPARATOR).to_string(), true)
        } else {
            (value.to_string(), false)
        };

        Self {
            base,
            paused,
            label: value.to_string(),
        }
    }

    fn new(base: String, paused: bool) -> Self {
        let label = match (paused, base.as_str()) {
            (false, _) => base.clone(),
            (true, "true") => PAUSED_MARKER.to_string(),
            (true, _) => format!("{}{}{}", base, PAUSED_SEPARATOR, PAUSED_MARKER),
        };
        Self { base, paused, label }
    }

    /// Legacy string form written to the node label
    pub fn to_label(&self) -> &str {
        &self.label
    }

    /// Underlying value without the paused marker
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Whether the paused marker is present
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether the component is expected to be running on this node.
    /// Empty and `"false"` are external decisions and are never overridden.
    pub fn is_enabled(&self) -> bool {
        !self.base.is_empty() && self.base != "false"
    }

    /// State to write while a mode switch is in progress
    pub fn paused(&self) -> Self {
        if self.paused || !self.is_enabled() {
            return self.clone();
        }
        Self::new(self.base.clone(), true)
    }

    /// State to write once the mode switch has finished
    pub fn resumed(&self) -> Self {
        if !self.paused {
            return self.clone();
        }
        Self::new(self.base.clone(), false)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
