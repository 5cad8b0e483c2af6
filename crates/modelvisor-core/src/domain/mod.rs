//! Domain types shared by the runtime, the database adapter and the binary.

mod engine;
mod hardware;
mod process;

pub use engine::{EngineDescriptor, EngineKind, EngineStatus, RunningModel};
pub use hardware::{
    ActivationConfig, ActivationOutcome, ComputeDevice, DeviceKind, HardwareRecord,
    RestartOutcome,
};
pub use process::LaunchCommand;
