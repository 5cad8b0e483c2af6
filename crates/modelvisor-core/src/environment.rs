//! Environment overlay applied to every child process.
//!
//! The server never mutates its own environment. Components that need to
//! influence children (visible devices, library search paths, the engine
//! directory override) write here, and process backends copy a snapshot
//! onto each command at spawn time. A child therefore sees the values that
//! were current when it started and is unaffected by later changes.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Default)]
pub struct ProcessEnvironment {
    vars: Arc<RwLock<BTreeMap<String, String>>>,
}

impl ProcessEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        tracing::debug!(%key, %value, "Child environment updated");
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Current overlay, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_overlay() {
        let env = ProcessEnvironment::new();
        let other = env.clone();
        env.set("CUDA_VISIBLE_DEVICES", "1,0");

        assert_eq!(other.get("CUDA_VISIBLE_DEVICES").as_deref(), Some("1,0"));
        assert_eq!(other.remove("CUDA_VISIBLE_DEVICES").as_deref(), Some("1,0"));
        assert!(env.snapshot().is_empty());
    }

    #[test]
    fn snapshot_is_sorted() {
        let env = ProcessEnvironment::new();
        env.set("B", "2");
        env.set("A", "1");
        assert_eq!(
            env.snapshot(),
            vec![("A".into(), "1".into()), ("B".into(), "2".into())]
        );
    }
}
