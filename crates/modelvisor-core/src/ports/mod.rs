//! Port definitions (trait abstractions) for modelvisor.
//!
//! Ports define the interfaces the runtime and the binary depend on. The
//! concrete implementations live in `modelvisor-runtime` (processes,
//! HTTP, device probing) and `modelvisor-db` (persistence).
//!
//! # Design Rules
//!
//! - No OS, HTTP or SQL types in any signature
//! - Errors are semantic domain types, not infrastructure errors

mod engine;
mod hardware;
mod process;

use thiserror::Error;

pub use engine::{
    EngineError, EngineInterface, EngineResponse, ResponseSink, ResponseStream, StatusEnvelope,
    error_body, status_body,
};
pub use hardware::{DeviceProbe, HardwareError, HardwareRepository};
pub use process::{ProcessBackend, ProcessControl, ProcessHandle};

/// Domain-specific errors for repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The requested entity was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage backend error (database, filesystem, etc.).
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored value could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Domain-specific errors for process operations.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be started at all.
    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    /// An output redirect target could not be opened.
    #[error("Failed to open output file {path}: {reason}")]
    Redirect { path: String, reason: String },

    /// Delivering a termination signal failed.
    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    /// Waiting for the process to exit failed.
    #[error("Failed to wait for process {pid}: {reason}")]
    WaitFailed { pid: u32, reason: String },
}
