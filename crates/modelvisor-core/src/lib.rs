//! Core domain types and port definitions for modelvisor.
//!
//! This crate has no knowledge of operating-system processes, HTTP clients,
//! or databases. It defines the engine contract, the process and hardware
//! ports, and the settings and path resolution shared by every adapter.
#![deny(unused_crate_dependencies)]

pub mod domain;
pub mod environment;
pub mod paths;
pub mod ports;
pub mod settings;

// Re-export commonly used types for convenience
pub use domain::{
    ActivationConfig, ActivationOutcome, ComputeDevice, DeviceKind, EngineDescriptor, EngineKind,
    EngineStatus, HardwareRecord, LaunchCommand, RestartOutcome, RunningModel,
};
pub use environment::ProcessEnvironment;
pub use paths::{
    DATA_DIR_ENV, ENGINE_PATH_ENV, PathError, ResolvedPaths, data_root, ensure_directory,
};
pub use ports::{
    DeviceProbe, EngineError, EngineInterface, EngineResponse, HardwareError, HardwareRepository,
    ProcessBackend, ProcessControl, ProcessError, ProcessHandle, RepositoryError, ResponseSink,
    ResponseStream, StatusEnvelope, error_body, status_body,
};
pub use settings::{
    DEFAULT_HOST, DEFAULT_PORT, ServerSettings, SettingsError, load_settings, validate_settings,
};
