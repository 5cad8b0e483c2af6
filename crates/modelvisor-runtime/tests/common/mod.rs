//! Shared fixtures for runtime integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modelvisor_core::EngineError;
use modelvisor_runtime::engine::{LlamaServerLauncher, SubprocessEngine, SubprocessEngineConfig};
use modelvisor_runtime::process::InMemoryProcessBackend;
use modelvisor_runtime::transport::{BackendTransport, ChunkStream};

pub const BASE_PORT: u16 = 40_000;

/// Loopback transport stand-in. Every port answers healthy unless marked
/// down; posts are recorded.
#[derive(Debug, Default)]
pub struct FakeTransport {
    down: Mutex<HashSet<u16>>,
    never_ready: AtomicBool,
    chunks: Mutex<Vec<Result<String, String>>>,
    posts: Mutex<Vec<(u16, String, Value)>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, port: u16) {
        self.down.lock().unwrap().insert(port);
    }

    pub fn set_never_ready(&self) {
        self.never_ready.store(true, Ordering::SeqCst);
    }

    pub fn set_stream(&self, chunks: Vec<Result<&str, &str>>) {
        *self.chunks.lock().unwrap() = chunks
            .into_iter()
            .map(|c| c.map(str::to_string).map_err(str::to_string))
            .collect();
    }

    pub fn posts(&self) -> Vec<(u16, String, Value)> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendTransport for FakeTransport {
    async fn probe(&self, port: u16, _path: &str) -> bool {
        !self.never_ready.load(Ordering::SeqCst) && !self.down.lock().unwrap().contains(&port)
    }

    async fn post_json(
        &self,
        port: u16,
        path: &str,
        body: &Value,
    ) -> Result<(u16, Value), EngineError> {
        self.posts
            .lock()
            .unwrap()
            .push((port, path.to_string(), body.clone()));
        if self.down.lock().unwrap().contains(&port) {
            return Err(EngineError::TransportFailure("connection refused".into()));
        }
        Ok((200, json!({ "echo": body, "port": port })))
    }

    async fn post_stream(
        &self,
        port: u16,
        path: &str,
        body: &Value,
    ) -> Result<ChunkStream, EngineError> {
        self.posts
            .lock()
            .unwrap()
            .push((port, path.to_string(), body.clone()));
        let items: Vec<Result<Bytes, EngineError>> = self
            .chunks
            .lock()
            .unwrap()
            .iter()
            .map(|c| match c {
                Ok(text) => Ok(Bytes::from(text.clone())),
                Err(reason) => Err(EngineError::TransportFailure(reason.clone())),
            })
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

pub fn config() -> SubprocessEngineConfig {
    SubprocessEngineConfig::new(BASE_PORT)
        .with_verify_port_free(false)
        .with_health_check(Duration::from_millis(5), 4)
        .with_shutdown_grace(Duration::from_millis(50))
}

pub fn engine_with(
    backend: &InMemoryProcessBackend,
    transport: &Arc<FakeTransport>,
    config: SubprocessEngineConfig,
) -> Arc<SubprocessEngine> {
    Arc::new(SubprocessEngine::new(
        "llama-cpp",
        Arc::new(LlamaServerLauncher::new(PathBuf::from(
            "/engines/llama-cpp/cpu/b1/llama-server",
        ))),
        Arc::new(backend.clone()),
        Arc::clone(transport) as Arc<dyn BackendTransport>,
        config,
    ))
}

pub fn load_request(model: &str) -> Value {
    json!({ "model": model, "model_path": format!("/models/{model}.gguf") })
}
