//! In-process engines.
//!
//! These engines live in a shared library loaded into the server's own
//! process. Rust cannot soundly resolve an arbitrary engine ABI at runtime,
//! so each in-process engine is compiled in and registered by name; the
//! catalog still resolves the variant's library path and publishes its
//! directory to the loader search path before the factory runs.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use modelvisor_core::{EngineError, EngineInterface};

/// Base name of the shared library every in-process variant ships.
pub const ENGINE_MODULE: &str = "engine";

/// What a factory learns about the variant it is asked to build.
#[derive(Debug, Clone)]
pub struct InProcessContext {
    pub engine: String,
    pub variant: String,
    pub engine_dir: PathBuf,
    /// Resolved engine library, when the variant ships one.
    pub module_path: Option<PathBuf>,
}

pub type EngineFactory =
    Arc<dyn Fn(&InProcessContext) -> Result<Arc<dyn EngineInterface>, EngineError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct InProcessRegistry {
    factories: HashMap<String, EngineFactory>,
}

impl fmt::Debug for InProcessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("InProcessRegistry")
            .field("engines", &names)
            .finish()
    }
}

impl InProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, engine: impl Into<String>, factory: F)
    where
        F: Fn(&InProcessContext) -> Result<Arc<dyn EngineInterface>, EngineError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(engine.into(), Arc::new(factory));
    }

    pub fn contains(&self, engine: &str) -> bool {
        self.factories.contains_key(engine)
    }

    pub fn create(&self, context: &InProcessContext) -> Result<Arc<dyn EngineInterface>, EngineError> {
        let factory = self.factories.get(&context.engine).ok_or_else(|| {
            EngineError::Unavailable(format!(
                "No in-process implementation registered for {}",
                context.engine
            ))
        })?;
        factory(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use modelvisor_core::{EngineKind, ResponseSink};
    use serde_json::Value;

    #[derive(Debug)]
    struct NullEngine;

    #[async_trait]
    impl EngineInterface for NullEngine {
        fn name(&self) -> &str {
            "null"
        }
        fn kind(&self) -> EngineKind {
            EngineKind::InProcess
        }
        async fn handle_chat_completion(&self, _request: Value, _sink: ResponseSink) {}
        async fn handle_embedding(&self, _request: Value, _sink: ResponseSink) {}
        async fn load_model(&self, _request: Value, _sink: ResponseSink) {}
        async fn unload_model(&self, _request: Value, _sink: ResponseSink) {}
        async fn get_model_status(&self, _request: Value, _sink: ResponseSink) {}
    }

    fn context(engine: &str) -> InProcessContext {
        InProcessContext {
            engine: engine.to_string(),
            variant: "cpu".to_string(),
            engine_dir: PathBuf::from("/engines/null/cpu/1.0"),
            module_path: None,
        }
    }

    #[test]
    fn test_create_registered_engine() {
        let mut registry = InProcessRegistry::new();
        registry.register("null", |_ctx| Ok(Arc::new(NullEngine) as Arc<dyn EngineInterface>));

        let engine = registry.create(&context("null")).unwrap();
        assert_eq!(engine.name(), "null");
        assert_eq!(engine.kind(), EngineKind::InProcess);
    }

    #[test]
    fn test_unregistered_engine_is_unavailable() {
        let registry = InProcessRegistry::new();
        let err = registry.create(&context("missing")).unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
