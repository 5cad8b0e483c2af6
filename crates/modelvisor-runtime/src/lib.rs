//! Engine runtime for modelvisor.
//!
//! - [`process`]: spawning, liveness and process-group termination
//! - [`dylib`]: native library search paths for in-process engines
//! - [`engine`]: the subprocess engine adapter and backend launchers
//! - [`catalog`]: installed engine discovery and resolution
//! - [`hardware`]: device inventory, activation and whole-server restart

#![deny(unsafe_code)]

pub mod catalog;
pub mod dylib;
pub mod engine;
pub mod hardware;
pub mod monitor;
pub mod process;
pub mod transport;

pub use catalog::{CatalogError, EngineCatalog, KNOWN_ENGINES, LoadedEngine, Platform};
pub use dylib::{DylibError, DylibPathManager, LIBRARY_PATH_VAR};
pub use engine::{InProcessRegistry, SubprocessEngine, SubprocessEngineConfig};
pub use hardware::{HardwareController, RestartOptions, Restarter, SystemDeviceProbe};
pub use monitor::LivenessMonitor;
pub use process::{InMemoryProcessBackend, OsProcessBackend};
pub use transport::{BackendTransport, HttpTransport};
