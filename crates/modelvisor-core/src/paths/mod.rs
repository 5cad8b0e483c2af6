//! Path utilities for modelvisor data directories.
//!
//! This module provides the canonical path resolution for all components:
//! - Data root (overridable via `MODELVISOR_DATA_DIR`)
//! - Engines directory (overridable via `ENGINE_PATH`)
//! - Logs directory and database file
//!
//! # Design
//!
//! - Returns `PathBuf` and `PathError` for clear error handling
//! - No interactive/terminal I/O

mod error;
mod resolver;

pub use error::PathError;
pub use resolver::{DATA_DIR_ENV, ENGINE_PATH_ENV, ResolvedPaths, data_root, ensure_directory};
