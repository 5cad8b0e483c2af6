//! Compute device inventory, activation and restart.

mod controller;
mod probe;
mod restart;

pub use controller::{
    CUDA_VISIBLE_DEVICES, HardwareController, VULKAN_VISIBLE_DEVICES, visible_devices_env,
};
pub use probe::{SystemDeviceProbe, parse_nvidia_smi};
pub use restart::{HEALTH_PATH, RestartOptions, Restarter};
