//! Composition root.
//!
//! Everything the server and the commands share is built here once and
//! passed down explicitly; nothing is reachable through globals.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use modelvisor_core::{
    ProcessBackend, ProcessEnvironment, ResolvedPaths, ServerSettings, load_settings,
    validate_settings,
};
use modelvisor_db::{SqliteHardwareRepository, setup_database};
use modelvisor_runtime::{
    DylibPathManager, EngineCatalog, HardwareController, HttpTransport, OsProcessBackend,
    RestartOptions, Restarter, SubprocessEngineConfig, SystemDeviceProbe,
};

use crate::parser::Cli;

/// Startup options gathered from the command line.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub config_file: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub log_level: String,
    pub quiet: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl CliConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            config_file: cli.config_file.clone(),
            data_dir: cli.data_dir.clone(),
            log_level: cli.log_level.clone(),
            quiet: cli.quiet,
            host: None,
            port: None,
        }
    }

    #[must_use]
    pub fn with_listen(mut self, host: Option<String>, port: Option<u16>) -> Self {
        self.host = host;
        self.port = port;
        self
    }
}

pub struct RuntimeContext {
    pub settings: ServerSettings,
    pub paths: ResolvedPaths,
    /// Environment overlay applied to every child process.
    pub env: ProcessEnvironment,
    pub backend: Arc<dyn ProcessBackend>,
    pub dylibs: Arc<DylibPathManager>,
    pub catalog: Arc<EngineCatalog>,
    pub hardware: Arc<HardwareController>,
    /// Cancelled on Ctrl-C; the serve loop and background tasks observe it.
    pub shutdown: CancellationToken,
}

impl RuntimeContext {
    pub fn host(&self) -> &str {
        self.settings.effective_host()
    }

    pub const fn port(&self) -> u16 {
        self.settings.effective_port()
    }
}

fn settings_for(config: &CliConfig) -> Result<ServerSettings> {
    let mut settings = load_settings(config.config_file.as_deref())?;
    if let Some(host) = &config.host {
        settings.host = Some(host.clone());
    }
    if let Some(port) = config.port {
        settings.port = Some(port);
    }
    validate_settings(&settings)?;
    Ok(settings)
}

pub async fn bootstrap(config: CliConfig) -> Result<RuntimeContext> {
    let settings = settings_for(&config)?;
    let paths = ResolvedPaths::resolve(config.data_dir.clone())?;
    paths.ensure()?;
    debug!(data_dir = %paths.data_dir.display(), engines = %paths.engines_dir.display(), "Resolved paths");

    let pool = setup_database(&paths.database_path)
        .await
        .context("Failed to open database")?;

    let env = ProcessEnvironment::new();
    let backend: Arc<dyn ProcessBackend> = Arc::new(OsProcessBackend::new(env.clone()));
    let dylibs = Arc::new(DylibPathManager::new(env.clone()));

    let engine_config = SubprocessEngineConfig::from_settings(&settings, Some(paths.logs_dir.clone()));
    let catalog = EngineCatalog::new(
        paths.engines_dir.clone(),
        Arc::clone(&dylibs),
        Arc::clone(&backend),
        Arc::new(HttpTransport::default()),
        engine_config,
    )
    .with_default_variants(settings.default_variants.clone())
    .with_uv_path(settings.effective_uv_path());

    let restart_options =
        RestartOptions::for_current_exe(paths.data_dir.clone(), paths.engines_dir.clone())?
            .with_config_file(config.config_file.clone())
            .with_log_level(config.log_level.clone())
            .with_log_file(paths.server_log());
    let hardware = HardwareController::new(
        Arc::new(SqliteHardwareRepository::new(pool)),
        Arc::new(SystemDeviceProbe::new()),
        env.clone(),
        Restarter::new(Arc::clone(&backend), restart_options),
    );

    Ok(RuntimeContext {
        settings,
        paths,
        env,
        backend,
        dylibs,
        catalog: Arc::new(catalog),
        hardware: Arc::new(hardware),
        shutdown: CancellationToken::new(),
    })
}
