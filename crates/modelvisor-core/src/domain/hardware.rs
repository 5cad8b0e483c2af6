//! Compute device inventory and activation types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Device category stored in the `type` column of the hardware table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Gpu,
    Cpu,
}

impl DeviceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpu" => Ok(Self::Gpu),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown device type: {other}")),
        }
    }
}

/// A device reported by a [`DeviceProbe`](crate::ports::DeviceProbe).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeDevice {
    /// Stable identity that survives re-enumeration.
    pub uuid: String,
    pub name: String,
    pub kind: DeviceKind,
    /// Index in the vendor runtime's numbering (CUDA ordinal).
    pub hardware_id: i64,
    /// Index in the cross-vendor numbering; activation requests address this.
    pub software_id: i64,
    /// Dedicated accelerator rather than integrated graphics.
    pub discrete: bool,
    pub total_memory_mib: Option<u64>,
}

/// Persisted per-device activation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareRecord {
    pub uuid: String,
    pub kind: DeviceKind,
    pub hardware_id: i64,
    pub software_id: i64,
    pub activated: bool,
    pub priority: i64,
}

/// Ordered selection of devices; position encodes priority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationConfig {
    pub selected_device_indices: Vec<i64>,
}

impl ActivationConfig {
    pub const fn new(selected_device_indices: Vec<i64>) -> Self {
        Self {
            selected_device_indices,
        }
    }
}

/// Result of applying an activation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// The requested ordering equals the persisted one.
    NoChange,
    /// The new ordering was persisted and takes effect after a restart.
    RestartRequired(ActivationConfig),
}

/// Result of a restart attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Nothing was pending; the current instance keeps running.
    NotNeeded,
    /// A replacement instance is up; the caller should exit.
    Replaced { pid: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_kind_round_trips_through_column_text() {
        assert_eq!("gpu".parse::<DeviceKind>(), Ok(DeviceKind::Gpu));
        assert_eq!(DeviceKind::Cpu.to_string(), "cpu");
        assert!("npu".parse::<DeviceKind>().is_err());
    }
}
