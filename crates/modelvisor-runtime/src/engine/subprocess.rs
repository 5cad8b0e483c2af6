//! Subprocess-backed engine adapter.
//!
//! Each loaded model is one child process serving HTTP on a loopback port
//! derived from the server's own port. The model table and the port
//! offsets share one `RwLock`; spawning, health polling and relaying all
//! happen with the lock released so a slow startup never blocks other
//! models.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use modelvisor_core::{
    EngineError, EngineInterface, EngineKind, ProcessBackend, ProcessHandle, ResponseSink,
    RunningModel, ServerSettings, StatusEnvelope, status_body,
};

use super::launcher::BackendLauncher;
use super::relay::relay_stream;
use super::request::{LoadModelRequest, require_model, wants_stream};
use super::table::{ModelSlot, ModelTable, SubprocessRecord};
use super::transform::TransformTemplates;
use crate::process::PortAllocator;
use crate::transport::BackendTransport;

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Tunables for one subprocess engine.
#[derive(Debug, Clone)]
pub struct SubprocessEngineConfig {
    /// The server's own port; model ports are offsets from it.
    pub base_port: u16,
    pub max_port_attempts: u16,
    pub health_check_interval: Duration,
    pub health_check_max_probes: u32,
    /// Concurrent streamed relays (2-4).
    pub stream_workers: usize,
    /// Skip ports already bound by other programs.
    pub verify_port_free: bool,
    /// Per-model output goes to `<logs_dir>/<engine>/<model>.log`.
    pub logs_dir: Option<PathBuf>,
    /// Wait between SIGTERM and SIGKILL when reaping.
    pub shutdown_grace: Duration,
}

impl SubprocessEngineConfig {
    pub const fn new(base_port: u16) -> Self {
        Self {
            base_port,
            max_port_attempts: 100,
            health_check_interval: Duration::from_secs(1),
            health_check_max_probes: 60,
            stream_workers: 2,
            verify_port_free: true,
            logs_dir: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn from_settings(settings: &ServerSettings, logs_dir: Option<PathBuf>) -> Self {
        Self {
            base_port: settings.effective_port(),
            max_port_attempts: settings.effective_max_port_attempts(),
            health_check_interval: settings.health_check_interval(),
            health_check_max_probes: settings.effective_health_check_max_probes(),
            stream_workers: settings.effective_stream_workers(),
            verify_port_free: true,
            logs_dir,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    #[must_use]
    pub const fn with_health_check(mut self, interval: Duration, max_probes: u32) -> Self {
        self.health_check_interval = interval;
        self.health_check_max_probes = max_probes;
        self
    }

    #[must_use]
    pub const fn with_max_port_attempts(mut self, attempts: u16) -> Self {
        self.max_port_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_verify_port_free(mut self, verify: bool) -> Self {
        self.verify_port_free = verify;
        self
    }

    #[must_use]
    pub fn with_stream_workers(mut self, workers: usize) -> Self {
        self.stream_workers = workers.clamp(2, 4);
        self
    }

    #[must_use]
    pub fn with_logs_dir(mut self, dir: PathBuf) -> Self {
        self.logs_dir = Some(dir);
        self
    }

    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

fn log_file_name(model: &str) -> String {
    let safe: String = model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.log")
}

/// A starting slot always counts as live; a running one only while its
/// process is.
fn is_live(slot: &ModelSlot) -> bool {
    match slot {
        ModelSlot::Running(record) => record.handle.is_alive(),
        ModelSlot::Starting { .. } => true,
    }
}

#[derive(Debug)]
pub struct SubprocessEngine {
    name: String,
    launcher: Arc<dyn BackendLauncher>,
    backend: Arc<dyn ProcessBackend>,
    transport: Arc<dyn BackendTransport>,
    config: SubprocessEngineConfig,
    table: Arc<RwLock<ModelTable>>,
    stream_pool: Arc<Semaphore>,
}

impl SubprocessEngine {
    pub fn new(
        name: impl Into<String>,
        launcher: Arc<dyn BackendLauncher>,
        backend: Arc<dyn ProcessBackend>,
        transport: Arc<dyn BackendTransport>,
        config: SubprocessEngineConfig,
    ) -> Self {
        let ports = PortAllocator::new(config.base_port, config.verify_port_free);
        let workers = config.stream_workers.clamp(2, 4);
        Self {
            name: name.into(),
            launcher,
            backend,
            transport,
            table: Arc::new(RwLock::new(ModelTable::new(ports))),
            stream_pool: Arc::new(Semaphore::new(workers)),
            config,
        }
    }

    pub fn stream_workers(&self) -> usize {
        self.config.stream_workers.clamp(2, 4)
    }

    /// Start `request.model` and wait until its backend reports ready.
    ///
    /// Returns the child's pid.
    pub async fn load(&self, request: LoadModelRequest) -> Result<u32, EngineError> {
        let model = request.model.clone();

        {
            let table = self.table.read().await;
            if table.slots.get(&model).is_some_and(is_live) {
                return Err(EngineError::AlreadyLoaded(model));
            }
        }

        let (port_offset, port) = {
            let mut table = self.table.write().await;
            match table.slots.get(&model) {
                Some(slot) if is_live(slot) => return Err(EngineError::AlreadyLoaded(model)),
                Some(_) => {
                    warn!(engine = %self.name, %model, "Purging record of exited process");
                    if let Some(ModelSlot::Running(stale)) = table.remove(&model) {
                        self.reap(stale);
                    }
                }
                None => {}
            }

            let offset = table.ports.allocate(self.config.max_port_attempts)?;
            let Some(port) = table.ports.port_for(offset) else {
                table.ports.release(offset);
                return Err(EngineError::PortExhaustion {
                    attempts: self.config.max_port_attempts,
                });
            };
            table.slots.insert(
                model.clone(),
                ModelSlot::Starting {
                    port_offset: offset,
                },
            );
            (offset, port)
        };

        match self.start(&request, port).await {
            Ok(handle) => {
                let pid = handle.pid();
                let record = SubprocessRecord {
                    model_id: model.clone(),
                    port,
                    port_offset,
                    handle,
                    start_time: Utc::now(),
                    transforms: TransformTemplates {
                        request: request.transform_request.clone(),
                        response: request.transform_response.clone(),
                    },
                };
                self.table
                    .write()
                    .await
                    .slots
                    .insert(model.clone(), ModelSlot::Running(record));
                info!(engine = %self.name, %model, pid, port, "Model loaded");
                Ok(pid)
            }
            Err(e) => {
                let mut table = self.table.write().await;
                if matches!(table.slots.get(&model), Some(ModelSlot::Starting { .. })) {
                    table.remove(&model);
                }
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        request: &LoadModelRequest,
        port: u16,
    ) -> Result<ProcessHandle, EngineError> {
        let mut command = self.launcher.build_command(request, port)?;
        if let Some(dir) = &self.config.logs_dir {
            command = command.log_to(&dir.join(&self.name).join(log_file_name(&request.model)));
        }

        debug!(engine = %self.name, model = %request.model, command = %command.display(), "Spawning backend");
        let handle = self.backend.spawn(&command).await.map_err(|e| {
            error!(engine = %self.name, model = %request.model, error = %e, "Failed to spawn backend");
            EngineError::SpawnFailure(e.to_string())
        })?;

        if let Err(e) = self.wait_until_ready(&request.model, &handle, port).await {
            error!(engine = %self.name, model = %request.model, error = %e, "Backend failed to become ready");
            let grace = self.config.shutdown_grace;
            tokio::spawn(async move {
                handle.shutdown(grace).await;
            });
            return Err(e);
        }
        Ok(handle)
    }

    async fn wait_until_ready(
        &self,
        model: &str,
        handle: &ProcessHandle,
        port: u16,
    ) -> Result<(), EngineError> {
        let health_path = self.launcher.health_path();
        let max_probes = self.config.health_check_max_probes;

        for probe in 1..=max_probes {
            if !handle.is_alive() {
                return Err(EngineError::ExitedDuringStartup(model.to_string()));
            }
            if self.transport.probe(port, health_path).await {
                debug!(model, port, probe, "Backend ready");
                return Ok(());
            }
            debug!(model, port, probe, max_probes, "Backend not ready yet");
            sleep(self.config.health_check_interval).await;
        }

        Err(EngineError::HealthCheckTimeout {
            model: model.to_string(),
            probes: max_probes,
        })
    }

    /// Stop `model`. Kill, port release and record removal happen under
    /// one write lock; reaping continues in the background.
    pub async fn unload(&self, model: &str) -> Result<(), EngineError> {
        let mut table = self.table.write().await;
        match table.slots.get(model) {
            None => return Err(EngineError::NotLoaded(model.to_string())),
            Some(ModelSlot::Starting { .. }) => {
                return Err(EngineError::Loading(model.to_string()));
            }
            Some(ModelSlot::Running(record)) => {
                if !record.handle.kill() {
                    return Err(EngineError::TerminationFailure(model.to_string()));
                }
            }
        }
        let removed = table.remove(model);
        drop(table);

        if let Some(ModelSlot::Running(record)) = removed {
            info!(engine = %self.name, model, pid = record.handle.pid(), "Model unloaded");
            self.reap(record);
        }
        Ok(())
    }

    /// Probe `model`'s backend once. An unreachable backend is treated as
    /// a crash: the record is purged and the model reported not loaded.
    pub async fn status(&self, model: &str) -> Result<RunningModel, EngineError> {
        let (info, alive) = {
            let table = self.table.read().await;
            match table.slots.get(model) {
                None => return Err(EngineError::NotLoaded(model.to_string())),
                Some(ModelSlot::Starting { .. }) => {
                    return Err(EngineError::Loading(model.to_string()));
                }
                Some(ModelSlot::Running(record)) => {
                    (record.describe(&self.name), record.handle.is_alive())
                }
            }
        };

        if alive
            && self
                .transport
                .probe(info.port, self.launcher.health_path())
                .await
        {
            return Ok(info);
        }

        warn!(engine = %self.name, model, pid = info.pid, "Model stopped running");
        self.purge(model, info.pid).await;
        Err(EngineError::NotLoaded(model.to_string()))
    }

    /// Running models, ordered by id.
    pub async fn running_models(&self) -> Vec<RunningModel> {
        let table = self.table.read().await;
        let mut models: Vec<RunningModel> =
            table.running().map(|r| r.describe(&self.name)).collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Purge records whose process has exited and signal what is left of
    /// their process groups. Returns their model ids.
    pub async fn sweep_dead(&self) -> Vec<String> {
        {
            let table = self.table.read().await;
            if table.running().all(|r| r.handle.is_alive()) {
                return Vec::new();
            }
        }

        let mut table = self.table.write().await;
        let dead: Vec<String> = table
            .running()
            .filter(|r| !r.handle.is_alive())
            .map(|r| r.model_id.clone())
            .collect();
        for model in &dead {
            if let Some(ModelSlot::Running(record)) = table.remove(model) {
                warn!(engine = %self.name, %model, pid = record.handle.pid(), "Model process exited, record purged");
                self.reap(record);
            }
        }
        dead
    }

    /// Stop every running model and wait for them to be reaped.
    pub async fn shutdown(&self) {
        let records: Vec<SubprocessRecord> = {
            let mut table = self.table.write().await;
            let ids: Vec<String> = table.running().map(|r| r.model_id.clone()).collect();
            ids.iter()
                .filter_map(|id| match table.remove(id) {
                    Some(ModelSlot::Running(record)) => Some(record),
                    _ => None,
                })
                .collect()
        };
        if records.is_empty() {
            return;
        }

        info!(engine = %self.name, count = records.len(), "Stopping running models");
        let grace = self.config.shutdown_grace;
        futures_util::future::join_all(records.iter().map(|r| r.handle.shutdown(grace))).await;
    }

    async fn route(&self, model: &str) -> Result<(u16, TransformTemplates), EngineError> {
        let (port, pid, transforms, alive) = {
            let table = self.table.read().await;
            match table.slots.get(model) {
                None => return Err(EngineError::NotLoaded(model.to_string())),
                Some(ModelSlot::Starting { .. }) => {
                    return Err(EngineError::Loading(model.to_string()));
                }
                Some(ModelSlot::Running(record)) => (
                    record.port,
                    record.handle.pid(),
                    record.transforms.clone(),
                    record.handle.is_alive(),
                ),
            }
        };

        if !alive {
            warn!(engine = %self.name, model, pid, "Model stopped running");
            self.purge(model, pid).await;
            return Err(EngineError::NotLoaded(model.to_string()));
        }
        Ok((port, transforms))
    }

    async fn purge(&self, model: &str, pid: u32) {
        let removed = self.table.write().await.remove_if_pid(model, pid);
        if let Some(record) = removed {
            self.reap(record);
        }
    }

    fn reap(&self, record: SubprocessRecord) {
        let grace = self.config.shutdown_grace;
        let engine = self.name.clone();
        tokio::spawn(async move {
            if !record.handle.shutdown(grace).await {
                warn!(%engine, model = %record.model_id, pid = record.handle.pid(), "Failed to reap model process");
            }
        });
    }

    async fn relay_once(
        &self,
        model: &str,
        port: u16,
        path: &str,
        body: &Value,
        transforms: &TransformTemplates,
        sink: &ResponseSink,
    ) {
        match self.transport.post_json(port, path, body).await {
            Ok((status, reply)) => {
                let reply = transforms.apply_response(model, reply);
                sink.send(StatusEnvelope::complete(status), reply).await;
            }
            Err(e) => {
                warn!(engine = %self.name, model, port, error = %e, "Relay failed");
                sink.fail(&e).await;
            }
        }
    }

    fn spawn_stream(
        &self,
        model: String,
        port: u16,
        body: Value,
        transforms: TransformTemplates,
        sink: ResponseSink,
    ) {
        let pool = Arc::clone(&self.stream_pool);
        let transport = Arc::clone(&self.transport);
        let path = self.launcher.chat_path();

        tokio::spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                sink.fail_stream(&EngineError::Unavailable(
                    "stream workers shut down".to_string(),
                ))
                .await;
                return;
            };
            match transport.post_stream(port, path, &body).await {
                Ok(chunks) => relay_stream(&model, chunks, &sink, &transforms).await,
                Err(e) => {
                    warn!(%model, port, error = %e, "Stream request failed");
                    sink.fail_stream(&e).await;
                }
            }
        });
    }

    async fn relay(&self, request: Value, sink: ResponseSink, path: &str, allow_stream: bool) {
        let model = match require_model(&request) {
            Ok(model) => model,
            Err(e) => return sink.fail(&e).await,
        };
        let (port, transforms) = match self.route(&model).await {
            Ok(route) => route,
            Err(e) => return sink.fail(&e).await,
        };

        let stream = allow_stream && wants_stream(&request);
        let body = transforms.apply_request(&model, request);
        if stream {
            self.spawn_stream(model, port, body, transforms, sink);
        } else {
            self.relay_once(&model, port, path, &body, &transforms, &sink)
                .await;
        }
    }
}

impl Drop for SubprocessEngine {
    // Best effort: async shutdown() is the normal path.
    fn drop(&mut self) {
        if let Ok(table) = self.table.try_read() {
            for record in table.running() {
                record.handle.kill();
            }
        }
    }
}

#[async_trait]
impl EngineInterface for SubprocessEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Subprocess
    }

    async fn handle_chat_completion(&self, request: Value, sink: ResponseSink) {
        let path = self.launcher.chat_path();
        self.relay(request, sink, path, true).await;
    }

    async fn handle_embedding(&self, request: Value, sink: ResponseSink) {
        let path = self.launcher.embeddings_path();
        self.relay(request, sink, path, false).await;
    }

    async fn load_model(&self, request: Value, sink: ResponseSink) {
        let result = match LoadModelRequest::parse(request) {
            Ok(request) => self.load(request).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(pid) => {
                sink.ok(status_body(format!(
                    "Model loaded successfully with pid: {pid}"
                )))
                .await;
            }
            Err(e) => sink.fail(&e).await,
        }
    }

    async fn unload_model(&self, request: Value, sink: ResponseSink) {
        let result = match require_model(&request) {
            Ok(model) => self.unload(&model).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => sink.ok(status_body("Unload model successfully")).await,
            Err(e) => sink.fail(&e).await,
        }
    }

    async fn get_model_status(&self, request: Value, sink: ResponseSink) {
        let result = match require_model(&request) {
            Ok(model) => self.status(&model).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(info) => {
                sink.ok(json!({
                    "model": info.id,
                    "engine": info.engine,
                    "port": info.port,
                    "pid": info.pid,
                    "start_time": info.start_time,
                    "status": "running",
                }))
                .await;
            }
            Err(e) => sink.fail(&e).await,
        }
    }

    async fn get_models(&self, _request: Value, sink: ResponseSink) {
        let data: Vec<Value> = self
            .running_models()
            .await
            .into_iter()
            .map(|m| {
                json!({
                    "id": m.id,
                    "engine": m.engine,
                    "port": m.port,
                    "pid": m.pid,
                    "start_time": m.start_time.timestamp(),
                    "object": "model",
                })
            })
            .collect();
        sink.ok(json!({ "object": "list", "data": data })).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name_sanitizes_separators() {
        assert_eq!(log_file_name("org/model:Q4"), "org_model_Q4.log");
        assert_eq!(log_file_name("tiny-1.1b_chat"), "tiny-1.1b_chat.log");
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = ServerSettings::with_defaults();
        settings.port = Some(40000);
        settings.stream_workers = Some(9);
        let config = SubprocessEngineConfig::from_settings(&settings, None);
        assert_eq!(config.base_port, 40000);
        assert_eq!(config.stream_workers, 4);
        assert!(config.verify_port_free);
    }
}
