//! Compute device detection.

use std::path::PathBuf;
use std::process::Command;
use sysinfo::System;
use tracing::{debug, warn};

use modelvisor_core::{ComputeDevice, DeviceKind, DeviceProbe};

const NVIDIA_QUERY: &str = "--query-gpu=index,uuid,name,memory.total";
const NVIDIA_FORMAT: &str = "--format=csv,noheader,nounits";

/// Probe backed by `nvidia-smi` for GPUs and `sysinfo` for the host CPU.
///
/// GPUs take software ids in enumeration order; the CPU entry comes last.
#[derive(Debug, Clone)]
pub struct SystemDeviceProbe {
    nvidia_smi: PathBuf,
    include_cpu: bool,
}

impl Default for SystemDeviceProbe {
    fn default() -> Self {
        Self {
            nvidia_smi: PathBuf::from("nvidia-smi"),
            include_cpu: true,
        }
    }
}

impl SystemDeviceProbe {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_nvidia_smi(mut self, path: PathBuf) -> Self {
        self.nvidia_smi = path;
        self
    }

    #[must_use]
    pub const fn with_cpu(mut self, include_cpu: bool) -> Self {
        self.include_cpu = include_cpu;
        self
    }

    fn nvidia_devices(&self) -> Vec<ComputeDevice> {
        let output = match Command::new(&self.nvidia_smi)
            .args([NVIDIA_QUERY, NVIDIA_FORMAT])
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                debug!(error = %e, "nvidia-smi not available");
                return Vec::new();
            }
        };
        if !output.status.success() {
            warn!(status = %output.status, "nvidia-smi query failed");
            return Vec::new();
        }
        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

impl DeviceProbe for SystemDeviceProbe {
    fn enumerate(&self) -> Vec<ComputeDevice> {
        let mut devices = self.nvidia_devices();
        if self.include_cpu {
            let software_id = i64::try_from(devices.len()).unwrap_or(i64::MAX);
            devices.push(cpu_device(software_id));
        }
        devices
    }
}

/// Parse `index, uuid, name, memory.total` rows. Malformed rows are skipped.
pub fn parse_nvidia_smi(stdout: &str) -> Vec<ComputeDevice> {
    let mut devices = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [index, uuid, name, memory] = fields.as_slice() else {
            warn!(line, "Skipping malformed nvidia-smi row");
            continue;
        };
        let Ok(hardware_id) = index.parse::<i64>() else {
            warn!(line, "Skipping nvidia-smi row with bad index");
            continue;
        };
        devices.push(ComputeDevice {
            uuid: (*uuid).to_string(),
            name: (*name).to_string(),
            kind: DeviceKind::Gpu,
            hardware_id,
            software_id: i64::try_from(devices.len()).unwrap_or(i64::MAX),
            discrete: true,
            total_memory_mib: memory.parse().ok(),
        });
    }
    devices
}

fn cpu_device(software_id: i64) -> ComputeDevice {
    let sys = System::new_all();
    let name = sys
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
        .unwrap_or_else(|| "CPU".to_string());

    ComputeDevice {
        uuid: "cpu-0".to_string(),
        name,
        kind: DeviceKind::Cpu,
        hardware_id: 0,
        software_id,
        discrete: false,
        total_memory_mib: Some(sys.total_memory() / (1024 * 1024)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi_rows() {
        let out = "0, GPU-aaaa, NVIDIA GeForce RTX 4090, 24564\n\
                   1, GPU-bbbb, NVIDIA RTX A2000, 6138\n";
        let devices = parse_nvidia_smi(out);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].uuid, "GPU-aaaa");
        assert_eq!(devices[1].name, "NVIDIA RTX A2000");
        assert_eq!(devices[1].hardware_id, 1);
        assert_eq!(devices[1].software_id, 1);
        assert_eq!(devices[0].total_memory_mib, Some(24564));
        assert!(devices.iter().all(|d| d.discrete && d.kind == DeviceKind::Gpu));
    }

    #[test]
    fn test_parse_skips_malformed_rows() {
        let out = "garbage\n3, GPU-cccc, Tesla T4, [N/A]\n\n";
        let devices = parse_nvidia_smi(out);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].hardware_id, 3);
        assert_eq!(devices[0].software_id, 0);
        assert_eq!(devices[0].total_memory_mib, None);
    }

    #[test]
    fn test_missing_nvidia_smi_still_reports_cpu() {
        let probe =
            SystemDeviceProbe::new().with_nvidia_smi(PathBuf::from("/nonexistent/nvidia-smi"));
        let devices = probe.enumerate();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].kind, DeviceKind::Cpu);
        assert_eq!(devices[0].software_id, 0);
    }
}
