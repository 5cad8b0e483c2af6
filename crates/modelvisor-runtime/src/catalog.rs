//! Installed engine discovery and resolution.
//!
//! Engines live under `<engines>/<engine>/<variant>/<version>/`. A variant
//! is ready once at least one version directory exists; the newest one
//! (by name, or by the `version` in its `version.json`) is used.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use modelvisor_core::{
    EngineDescriptor, EngineError, EngineInterface, EngineKind, EngineStatus, ProcessBackend,
};

use crate::dylib::{DylibError, DylibPathManager};
use crate::engine::{
    BackendLauncher, ENGINE_MODULE, InProcessContext, InProcessRegistry, LlamaServerLauncher,
    PythonLauncher, SubprocessEngine, SubprocessEngineConfig, VllmLauncher,
};
use crate::transport::BackendTransport;

const VERSION_FILE: &str = "version.json";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Engine {0} is not supported")]
    UnknownEngine(String),

    #[error("Engine {engine} is not compatible with {platform}")]
    Incompatible { engine: String, platform: String },

    #[error("Engine {0} is not installed")]
    NotInstalled(String),

    #[error("Engine variant does not exist: {engine}/{variant}")]
    VariantNotFound { engine: String, variant: String },

    #[error("Failed to access {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error(transparent)]
    Dylib(#[from] DylibError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Operating system and CPU architecture, as `std::env::consts` names them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Support {
    All,
    Only {
        os: &'static str,
        arch: Option<&'static str>,
    },
}

impl Support {
    fn includes(self, platform: &Platform) -> bool {
        match self {
            Self::All => true,
            Self::Only { os, arch } => {
                platform.os == os && arch.is_none_or(|arch| platform.arch == arch)
            }
        }
    }
}

/// How a known engine is brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    LlamaServer,
    Python,
    Vllm,
    InProcess,
}

impl Backend {
    const fn kind(self) -> EngineKind {
        match self {
            Self::InProcess => EngineKind::InProcess,
            Self::LlamaServer | Self::Python | Self::Vllm => EngineKind::Subprocess,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KnownEngine {
    pub name: &'static str,
    pub product_name: &'static str,
    pub supported_format: &'static str,
    backend: Backend,
    support: Support,
}

impl KnownEngine {
    pub const fn kind(&self) -> EngineKind {
        self.backend.kind()
    }

    pub fn supports(&self, platform: &Platform) -> bool {
        self.support.includes(platform)
    }
}

pub const KNOWN_ENGINES: &[KnownEngine] = &[
    KnownEngine {
        name: "llama-cpp",
        product_name: "llama.cpp",
        supported_format: "gguf",
        backend: Backend::LlamaServer,
        support: Support::All,
    },
    KnownEngine {
        name: "python-engine",
        product_name: "Python Engine",
        supported_format: "python",
        backend: Backend::Python,
        support: Support::All,
    },
    KnownEngine {
        name: "vllm",
        product_name: "vLLM",
        supported_format: "safetensors",
        backend: Backend::Vllm,
        support: Support::Only {
            os: "linux",
            arch: Some("x86_64"),
        },
    },
    KnownEngine {
        name: "onnxruntime",
        product_name: "ONNX Runtime",
        supported_format: "onnx",
        backend: Backend::InProcess,
        support: Support::Only {
            os: "windows",
            arch: None,
        },
    },
];

pub fn known_engine(name: &str) -> Option<&'static KnownEngine> {
    KNOWN_ENGINES.iter().find(|e| e.name == name)
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    version: Option<String>,
}

/// A resolved engine. Subprocess engines keep their concrete type so the
/// liveness monitor and shutdown can reach their model tables.
#[derive(Debug, Clone)]
pub enum LoadedEngine {
    InProcess(Arc<dyn EngineInterface>),
    Subprocess(Arc<SubprocessEngine>),
}

impl LoadedEngine {
    pub const fn kind(&self) -> EngineKind {
        match self {
            Self::InProcess(_) => EngineKind::InProcess,
            Self::Subprocess(_) => EngineKind::Subprocess,
        }
    }

    pub fn interface(&self) -> Arc<dyn EngineInterface> {
        match self {
            Self::InProcess(engine) => Arc::clone(engine),
            Self::Subprocess(engine) => Arc::clone(engine) as Arc<dyn EngineInterface>,
        }
    }
}

#[derive(Debug, Default)]
struct CatalogCache {
    engines: HashMap<(String, String), LoadedEngine>,
    /// Port windows handed out so far; see [`EngineCatalog::port_window`].
    windows: u32,
}

#[derive(Debug)]
pub struct EngineCatalog {
    engines_dir: PathBuf,
    platform: Platform,
    default_variants: BTreeMap<String, String>,
    registry: InProcessRegistry,
    dylibs: Arc<DylibPathManager>,
    backend: Arc<dyn ProcessBackend>,
    transport: Arc<dyn BackendTransport>,
    engine_config: SubprocessEngineConfig,
    uv_path: PathBuf,
    cache: Mutex<CatalogCache>,
}

impl EngineCatalog {
    pub fn new(
        engines_dir: PathBuf,
        dylibs: Arc<DylibPathManager>,
        backend: Arc<dyn ProcessBackend>,
        transport: Arc<dyn BackendTransport>,
        engine_config: SubprocessEngineConfig,
    ) -> Self {
        Self {
            engines_dir,
            platform: Platform::current(),
            default_variants: BTreeMap::new(),
            registry: InProcessRegistry::default(),
            dylibs,
            backend,
            transport,
            engine_config,
            uv_path: PathBuf::from("uv"),
            cache: Mutex::new(CatalogCache::default()),
        }
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn with_default_variants(mut self, defaults: BTreeMap<String, String>) -> Self {
        self.default_variants = defaults;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: InProcessRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_uv_path(mut self, uv: PathBuf) -> Self {
        self.uv_path = uv;
        self
    }

    pub fn engines_dir(&self) -> &Path {
        &self.engines_dir
    }

    pub const fn platform(&self) -> &Platform {
        &self.platform
    }

    /// One row per installed (engine, variant); one row for engines with
    /// nothing installed; a single `Incompatible` row for engines this
    /// platform cannot run.
    pub fn list_installed(&self) -> Vec<EngineDescriptor> {
        let mut rows = Vec::new();
        for known in KNOWN_ENGINES {
            let row = |variant: Option<String>, version: Option<String>, status| EngineDescriptor {
                name: known.name.to_string(),
                product_name: known.product_name.to_string(),
                supported_format: known.supported_format.to_string(),
                version,
                variant,
                status,
            };

            if !known.supports(&self.platform) {
                rows.push(row(None, None, EngineStatus::Incompatible));
                continue;
            }

            let variants = subdirectories(&self.engines_dir.join(known.name));
            if variants.is_empty() {
                rows.push(row(None, None, EngineStatus::NotInstalled));
                continue;
            }

            for variant in variants {
                let variant_dir = self.engines_dir.join(known.name).join(&variant);
                match newest_version(&variant_dir) {
                    Some((dir, name)) => {
                        let version = read_version(&dir).unwrap_or(name);
                        rows.push(row(Some(variant), Some(version), EngineStatus::Ready));
                    }
                    None => rows.push(row(Some(variant), None, EngineStatus::NotInstalled)),
                }
            }
        }
        rows
    }

    /// Ready variants of `name`, sorted.
    pub fn ready_variants(&self, name: &str) -> Vec<String> {
        subdirectories(&self.engines_dir.join(name))
            .into_iter()
            .filter(|v| newest_version(&self.engines_dir.join(name).join(v)).is_some())
            .collect()
    }

    fn select_variant(&self, name: &str, requested: Option<&str>) -> Result<String, CatalogError> {
        if let Some(variant) = requested {
            return Ok(variant.to_string());
        }
        if let Some(variant) = self.default_variants.get(name) {
            return Ok(variant.clone());
        }
        self.ready_variants(name)
            .pop()
            .ok_or_else(|| CatalogError::NotInstalled(name.to_string()))
    }

    /// Engine serving `name`, built on first use and cached per variant.
    pub fn resolve(
        &self,
        name: &str,
        variant: Option<&str>,
    ) -> Result<Arc<dyn EngineInterface>, CatalogError> {
        self.resolve_loaded(name, variant).map(|e| e.interface())
    }

    pub fn resolve_loaded(
        &self,
        name: &str,
        variant: Option<&str>,
    ) -> Result<LoadedEngine, CatalogError> {
        let known =
            known_engine(name).ok_or_else(|| CatalogError::UnknownEngine(name.to_string()))?;
        if !known.supports(&self.platform) {
            return Err(CatalogError::Incompatible {
                engine: name.to_string(),
                platform: self.platform.to_string(),
            });
        }

        let variant = self.select_variant(name, variant)?;
        let key = (name.to_string(), variant.clone());
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(loaded) = cache.engines.get(&key) {
            return Ok(loaded.clone());
        }

        let (version_dir, _) = newest_version(&self.engines_dir.join(name).join(&variant))
            .ok_or_else(|| CatalogError::VariantNotFound {
                engine: name.to_string(),
                variant: variant.clone(),
            })?;

        let loaded = match self.launcher(known.backend, &version_dir) {
            Some(launcher) => {
                let window = cache.windows;
                cache.windows += 1;
                LoadedEngine::Subprocess(Arc::new(SubprocessEngine::new(
                    name,
                    launcher,
                    Arc::clone(&self.backend),
                    Arc::clone(&self.transport),
                    self.port_window(window),
                )))
            }
            None => self.load_in_process(name, &variant, version_dir)?,
        };

        info!(engine = name, %variant, kind = ?loaded.kind(), "Engine resolved");
        cache.engines.insert(key, loaded.clone());
        Ok(loaded)
    }

    /// Launcher for a subprocess backend; `None` for in-process engines.
    fn launcher(&self, backend: Backend, version_dir: &Path) -> Option<Arc<dyn BackendLauncher>> {
        let launcher: Arc<dyn BackendLauncher> = match backend {
            Backend::InProcess => return None,
            Backend::LlamaServer => Arc::new(LlamaServerLauncher::in_dir(version_dir)),
            Backend::Python => Arc::new(PythonLauncher::new(
                self.uv_path.clone(),
                Some(version_dir.join(".uv-cache")),
            )),
            Backend::Vllm => Arc::new(VllmLauncher::new(
                self.uv_path.clone(),
                version_dir.to_path_buf(),
            )),
        };
        Some(launcher)
    }

    /// Every subprocess engine gets its own range of
    /// `max_port_attempts + 1` ports above the server port, so two engines
    /// never hand out the same port.
    fn port_window(&self, window: u32) -> SubprocessEngineConfig {
        let mut config = self.engine_config.clone();
        let stride = u32::from(config.max_port_attempts) + 1;
        let base = u32::from(config.base_port) + window * stride;
        config.base_port = u16::try_from(base).unwrap_or(u16::MAX);
        config
    }

    fn load_in_process(
        &self,
        name: &str,
        variant: &str,
        version_dir: PathBuf,
    ) -> Result<LoadedEngine, CatalogError> {
        self.dylibs
            .register_path(name, std::slice::from_ref(&version_dir))?;
        let context = InProcessContext {
            engine: name.to_string(),
            variant: variant.to_string(),
            module_path: self.dylibs.resolve_library(name, ENGINE_MODULE),
            engine_dir: version_dir,
        };
        debug!(engine = name, module = ?context.module_path, "Creating in-process engine");
        Ok(LoadedEngine::InProcess(self.registry.create(&context)?))
    }

    /// Delete every installed variant of `name`.
    ///
    /// Running models are not checked; callers unload them first.
    pub fn uninstall(&self, name: &str) -> Result<(), CatalogError> {
        if known_engine(name).is_none() {
            return Err(CatalogError::UnknownEngine(name.to_string()));
        }
        let dir = self.engines_dir.join(name);
        if !dir.is_dir() {
            return Err(CatalogError::NotInstalled(name.to_string()));
        }

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .engines
            .retain(|(engine, _), _| engine != name);
        match self.dylibs.unregister(name) {
            Ok(()) | Err(DylibError::UnknownKey(_)) => {}
            Err(e) => return Err(e.into()),
        }

        fs::remove_dir_all(&dir).map_err(|e| CatalogError::Io {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        info!(engine = name, path = %dir.display(), "Engine uninstalled");
        Ok(())
    }

    /// Resolved subprocess engines, for liveness sweeps.
    pub fn subprocess_engines(&self) -> Vec<Arc<SubprocessEngine>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .engines
            .values()
            .filter_map(|loaded| match loaded {
                LoadedEngine::Subprocess(engine) => Some(Arc::clone(engine)),
                LoadedEngine::InProcess(_) => None,
            })
            .collect()
    }

    /// Stop the models of every resolved subprocess engine.
    pub async fn shutdown(&self) {
        let engines = self.subprocess_engines();
        futures_util::future::join_all(engines.iter().map(|e| e.shutdown())).await;
    }
}

fn subdirectories(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names
}

fn newest_version(variant_dir: &Path) -> Option<(PathBuf, String)> {
    let newest = subdirectories(variant_dir).pop()?;
    Some((variant_dir.join(&newest), newest))
}

fn read_version(version_dir: &Path) -> Option<String> {
    let path = version_dir.join(VERSION_FILE);
    let raw = fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<VersionInfo>(&raw) {
        Ok(info) => info.version,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed version file");
            None
        }
    }
}
