//! Resolution of the data, engines and logs directories.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::PathError;

/// Environment variable overriding the data root.
pub const DATA_DIR_ENV: &str = "MODELVISOR_DATA_DIR";

/// Environment variable overriding the engines directory.
///
/// The restart protocol sets it on the replacement instance so both
/// generations read engines from the same place.
pub const ENGINE_PATH_ENV: &str = "ENGINE_PATH";

const APP_DIR: &str = "modelvisor";

/// Default data root: `$MODELVISOR_DATA_DIR`, else `<system data dir>/modelvisor`.
pub fn data_root() -> Result<PathBuf, PathError> {
    if let Ok(dir) = env::var(DATA_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|d| d.join(APP_DIR))
        .ok_or(PathError::NoDataDir)
}

/// Create `path` (and parents) if missing; fail if it exists as a file.
pub fn ensure_directory(path: &Path) -> Result<(), PathError> {
    if path.exists() {
        if path.is_dir() {
            return Ok(());
        }
        return Err(PathError::NotADirectory(path.to_path_buf()));
    }
    fs::create_dir_all(path).map_err(|e| PathError::CreateFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Every location the server reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub data_dir: PathBuf,
    pub engines_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub database_path: PathBuf,
}

impl ResolvedPaths {
    /// Resolve from an explicit data directory (CLI flag) or the defaults,
    /// honouring `ENGINE_PATH`.
    pub fn resolve(data_dir: Option<PathBuf>) -> Result<Self, PathError> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => data_root()?,
        };
        let engine_override = env::var(ENGINE_PATH_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Ok(Self::from_data_dir(data_dir, engine_override))
    }

    /// Pure constructor used by tests and by `resolve`.
    pub fn from_data_dir(data_dir: PathBuf, engine_override: Option<PathBuf>) -> Self {
        let engines_dir = engine_override.unwrap_or_else(|| data_dir.join("engines"));
        Self {
            logs_dir: data_dir.join("logs"),
            database_path: data_dir.join("modelvisor.db"),
            engines_dir,
            data_dir,
        }
    }

    /// Create the data, engines and logs directories.
    pub fn ensure(&self) -> Result<(), PathError> {
        ensure_directory(&self.data_dir)?;
        ensure_directory(&self.engines_dir)?;
        ensure_directory(&self.logs_dir)
    }

    /// Log file for the replacement instance started by a restart.
    pub fn server_log(&self) -> PathBuf {
        self.logs_dir.join("server.log")
    }
}
