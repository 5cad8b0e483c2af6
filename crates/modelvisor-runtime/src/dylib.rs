//! Native library search paths for engines.
//!
//! Engines register the directories holding their native modules under a
//! key (the engine name). Registered directories are prepended to the
//! platform's library search variable in the child environment overlay,
//! and the in-process loader resolves module files through them.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

use modelvisor_core::ProcessEnvironment;

/// Library search variable for the current platform.
#[cfg(target_os = "windows")]
pub const LIBRARY_PATH_VAR: &str = "PATH";
#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DylibError {
    #[error("Library path does not exist: {0}")]
    PathNotFound(PathBuf),

    #[error("Library path cannot be added to the search path: {0}")]
    InvalidPath(PathBuf),

    #[error("Key not found: {0}")]
    UnknownKey(String),
}

/// File name of a native module on this platform.
pub fn library_file_name(module: &str) -> String {
    format!("{}{module}{}", env::consts::DLL_PREFIX, env::consts::DLL_SUFFIX)
}

#[derive(Debug)]
pub struct DylibPathManager {
    env: ProcessEnvironment,
    inherited: Option<OsString>,
    registered: Mutex<BTreeMap<String, Vec<PathBuf>>>,
}

impl DylibPathManager {
    /// Manager seeded with the server's own inherited search path.
    pub fn new(env: ProcessEnvironment) -> Self {
        Self::with_inherited(env, env::var_os(LIBRARY_PATH_VAR))
    }

    pub fn with_inherited(env: ProcessEnvironment, inherited: Option<OsString>) -> Self {
        Self {
            env,
            inherited,
            registered: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register `paths` under `key`, replacing any previous registration.
    ///
    /// Every path is validated before anything is changed; on failure the
    /// previous state is left untouched. Paths must be valid UTF-8 since the
    /// environment overlay stores text.
    pub fn register_path(&self, key: &str, paths: &[PathBuf]) -> Result<(), DylibError> {
        for path in paths {
            if path.to_str().is_none() {
                return Err(DylibError::InvalidPath(path.clone()));
            }
            if !path.is_dir() {
                return Err(DylibError::PathNotFound(path.clone()));
            }
        }

        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = registered.clone();
        next.insert(key.to_string(), paths.to_vec());
        let value = self.search_value(&next)?;

        *registered = next;
        self.publish(value);
        info!(key, count = paths.len(), "Registered library search paths");
        Ok(())
    }

    /// Remove `key`'s paths from the search path.
    pub fn unregister(&self, key: &str) -> Result<(), DylibError> {
        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = registered.clone();
        if next.remove(key).is_none() {
            return Err(DylibError::UnknownKey(key.to_string()));
        }
        let value = self.search_value(&next)?;

        *registered = next;
        self.publish(value);
        debug!(key, "Unregistered library search paths");
        Ok(())
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// All registered directories, grouped by key.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Locate `module`'s library file within `key`'s directories.
    pub fn resolve_library(&self, key: &str, module: &str) -> Option<PathBuf> {
        let file_name = library_file_name(module);
        let registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
        registered
            .get(key)?
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
    }

    fn search_value(
        &self,
        registered: &BTreeMap<String, Vec<PathBuf>>,
    ) -> Result<Option<String>, DylibError> {
        let mut entries: Vec<PathBuf> = registered.values().flatten().cloned().collect();
        if entries.is_empty() {
            return Ok(None);
        }
        if let Some(inherited) = &self.inherited {
            entries.extend(env::split_paths(inherited));
        }
        let offending = |bad: fn(&Path) -> bool| {
            let path = entries.iter().find(|p| bad(p)).cloned().unwrap_or_default();
            DylibError::InvalidPath(path)
        };
        let joined = env::join_paths(entries.iter().map(PathBuf::as_path))
            .map_err(|_| offending(contains_separator))?;
        joined
            .into_string()
            .map(Some)
            .map_err(|_| offending(|p| p.to_str().is_none()))
    }

    fn publish(&self, value: Option<String>) {
        match value {
            Some(value) => self.env.set(LIBRARY_PATH_VAR, value),
            None => {
                self.env.remove(LIBRARY_PATH_VAR);
            }
        }
    }
}

fn contains_separator(path: &Path) -> bool {
    let separator = if cfg!(windows) { ';' } else { ':' };
    path.to_string_lossy().contains(separator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn manager() -> (DylibPathManager, ProcessEnvironment) {
        let env = ProcessEnvironment::new();
        (
            DylibPathManager::with_inherited(env.clone(), Some(OsString::from("/usr/lib"))),
            env,
        )
    }

    #[test]
    fn register_prepends_to_inherited_value() {
        let temp = tempdir().unwrap();
        let (dylibs, env) = manager();

        dylibs
            .register_path("onnxruntime", &[temp.path().to_path_buf()])
            .unwrap();

        let value = env.get(LIBRARY_PATH_VAR).unwrap();
        let parts: Vec<PathBuf> = env::split_paths(&value).collect();
        assert_eq!(parts.first(), Some(&temp.path().to_path_buf()));
        assert_eq!(parts.last(), Some(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn invalid_path_leaves_nothing_registered() {
        let temp = tempdir().unwrap();
        let (dylibs, env) = manager();
        let paths = vec![temp.path().to_path_buf(), temp.path().join("missing")];

        let err = dylibs.register_path("onnxruntime", &paths).unwrap_err();
        assert_eq!(err, DylibError::PathNotFound(temp.path().join("missing")));
        assert!(!dylibs.is_registered("onnxruntime"));
        assert!(env.get(LIBRARY_PATH_VAR).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_path_is_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = tempdir().unwrap();
        let (dylibs, env) = manager();
        dylibs.register_path("a", &[temp.path().to_path_buf()]).unwrap();
        let before = env.get(LIBRARY_PATH_VAR);

        let bad = temp.path().join(OsStr::from_bytes(b"lib\xff"));
        let err = dylibs.register_path("b", &[bad.clone()]).unwrap_err();
        assert_eq!(err, DylibError::InvalidPath(bad));
        assert!(!dylibs.is_registered("b"));
        assert_eq!(env.get(LIBRARY_PATH_VAR), before);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_inherited_value_is_rejected() {
        use std::os::unix::ffi::OsStringExt;

        let temp = tempdir().unwrap();
        let env = ProcessEnvironment::new();
        let inherited = OsString::from_vec(b"/opt/\xfflib".to_vec());
        let dylibs = DylibPathManager::with_inherited(env.clone(), Some(inherited));

        let err = dylibs.register_path("a", &[temp.path().to_path_buf()]).unwrap_err();
        assert_eq!(
            err,
            DylibError::InvalidPath(PathBuf::from(OsString::from_vec(b"/opt/\xfflib".to_vec())))
        );
        assert!(!dylibs.is_registered("a"));
        assert!(env.get(LIBRARY_PATH_VAR).is_none());
    }

    #[test]
    fn unregister_removes_paths() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let (dylibs, env) = manager();
        dylibs.register_path("a", &[a.path().to_path_buf()]).unwrap();
        dylibs.register_path("b", &[b.path().to_path_buf()]).unwrap();

        dylibs.unregister("a").unwrap();
        assert_eq!(dylibs.search_paths(), vec![b.path().to_path_buf()]);

        dylibs.unregister("b").unwrap();
        assert!(env.get(LIBRARY_PATH_VAR).is_none());
    }

    #[test]
    fn unregister_unknown_key_fails() {
        let (dylibs, _) = manager();
        assert_eq!(
            dylibs.unregister("nope"),
            Err(DylibError::UnknownKey("nope".into()))
        );
        assert_eq!(dylibs.unregister("nope").unwrap_err().to_string(), "Key not found: nope");
    }

    #[test]
    fn resolve_library_finds_module_file() {
        let temp = tempdir().unwrap();
        let module = temp.path().join(library_file_name("engine"));
        fs::write(&module, b"").unwrap();

        let (dylibs, _) = manager();
        assert!(dylibs.resolve_library("onnxruntime", "engine").is_none());
        dylibs
            .register_path("onnxruntime", &[temp.path().to_path_buf()])
            .unwrap();
        assert_eq!(dylibs.resolve_library("onnxruntime", "engine"), Some(module));

        dylibs.unregister("onnxruntime").unwrap();
        assert!(dylibs.resolve_library("onnxruntime", "engine").is_none());
    }
}
