//! Whole-server restart.
//!
//! A replacement instance is spawned with the current configuration flags
//! and the new device environment, then polled on `/healthz`. The caller
//! exits only after the replacement answers; if it never does, it is
//! killed and the current instance keeps serving.

use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use modelvisor_core::{
    ENGINE_PATH_ENV, HardwareError, LaunchCommand, ProcessBackend, ProcessHandle,
};

pub const HEALTH_PATH: &str = "/healthz";

const DEFAULT_MAX_RETRIES: u32 = 4;
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How the running server was started; replayed onto the replacement.
#[derive(Debug, Clone)]
pub struct RestartOptions {
    pub executable: PathBuf,
    pub config_file: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub engines_dir: PathBuf,
    pub log_level: String,
    /// Replacement's stdout/stderr.
    pub log_file: Option<PathBuf>,
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl RestartOptions {
    pub fn new(executable: PathBuf, data_dir: PathBuf, engines_dir: PathBuf) -> Self {
        Self {
            executable,
            config_file: None,
            data_dir,
            engines_dir,
            log_level: "info".to_string(),
            log_file: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Options that re-run the current executable.
    pub fn for_current_exe(data_dir: PathBuf, engines_dir: PathBuf) -> Result<Self, HardwareError> {
        let executable =
            std::env::current_exe().map_err(|e| HardwareError::RestartSpawn(e.to_string()))?;
        Ok(Self::new(executable, data_dir, engines_dir))
    }

    #[must_use]
    pub fn with_config_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_file = path;
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    #[must_use]
    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, max_retries: u32, interval: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_interval = interval;
        self
    }
}

/// Host to probe for a server bound on `host`.
fn reachable_host(host: &str) -> String {
    match host {
        "" | "0.0.0.0" => "127.0.0.1".to_string(),
        "::" | "[::]" => "[::1]".to_string(),
        h if h.contains(':') && !h.starts_with('[') => format!("[{h}]"),
        h => h.to_string(),
    }
}

#[derive(Debug)]
pub struct Restarter {
    backend: Arc<dyn ProcessBackend>,
    client: Client,
    options: RestartOptions,
}

impl Restarter {
    pub fn new(backend: Arc<dyn ProcessBackend>, options: RestartOptions) -> Self {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            backend,
            client,
            options,
        }
    }

    pub const fn options(&self) -> &RestartOptions {
        &self.options
    }

    /// Command line of the replacement instance.
    pub fn command(&self, host: &str, port: u16, env: &[(String, String)]) -> LaunchCommand {
        let opts = &self.options;
        let mut cmd = LaunchCommand::new(&opts.executable)
            .arg("serve")
            .arg("--host")
            .arg(host)
            .arg("--port")
            .arg(port.to_string())
            .arg("--data-dir")
            .arg(opts.data_dir.display().to_string())
            .arg("--log-level")
            .arg(&opts.log_level)
            .arg("--quiet");
        if let Some(config) = &opts.config_file {
            cmd = cmd.arg("--config-file").arg(config.display().to_string());
        }
        for (key, value) in env {
            cmd = cmd.env(key, value);
        }
        cmd = cmd.env(ENGINE_PATH_ENV, opts.engines_dir.display().to_string());
        if let Some(log) = &opts.log_file {
            cmd = cmd.log_to(log);
        }
        cmd
    }

    /// Start the replacement and wait for it to answer. Returns its pid.
    pub async fn restart(
        &self,
        host: &str,
        port: u16,
        env: &[(String, String)],
    ) -> Result<u32, HardwareError> {
        let command = self.command(host, port, env);
        info!(command = %command.display(), "Spawning replacement server");
        let handle = self
            .backend
            .spawn(&command)
            .await
            .map_err(|e| HardwareError::RestartSpawn(e.to_string()))?;

        let url = format!("http://{}:{port}{HEALTH_PATH}", reachable_host(host));
        if self.wait_reachable(&url, &handle).await {
            info!(pid = handle.pid(), %url, "Replacement server is up");
            return Ok(handle.pid());
        }

        warn!(pid = handle.pid(), %url, "Replacement server never became reachable");
        handle.shutdown(KILL_GRACE).await;
        Err(HardwareError::RestartUnreachable {
            url,
            attempts: self.options.max_retries,
        })
    }

    async fn wait_reachable(&self, url: &str, handle: &ProcessHandle) -> bool {
        for attempt in 1..=self.options.max_retries {
            sleep(self.options.retry_interval).await;
            if !handle.is_alive() {
                warn!(pid = handle.pid(), "Replacement server exited during startup");
                return false;
            }
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return true,
                Ok(resp) => debug!(attempt, status = %resp.status(), "Replacement not ready"),
                Err(e) => debug!(attempt, error = %e, "Replacement not reachable"),
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::InMemoryProcessBackend;
    use axum::{Router, routing::get};
    use tokio::net::TcpListener;

    fn options() -> RestartOptions {
        RestartOptions::new(
            PathBuf::from("/opt/modelvisor/bin/modelvisor"),
            PathBuf::from("/data"),
            PathBuf::from("/data/engines"),
        )
        .with_config_file(Some(PathBuf::from("/etc/modelvisor.json")))
        .with_log_level("debug")
        .with_retry(4, Duration::from_millis(20))
    }

    async fn healthz_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route(HEALTH_PATH, get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[test]
    fn test_reachable_host() {
        assert_eq!(reachable_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(reachable_host("::"), "[::1]");
        assert_eq!(reachable_host("fe80::1"), "[fe80::1]");
        assert_eq!(reachable_host("localhost"), "localhost");
    }

    #[test]
    fn test_command_replays_flags_and_env() {
        let restarter = Restarter::new(Arc::new(InMemoryProcessBackend::new()), options());
        let env = vec![("CUDA_VISIBLE_DEVICES".to_string(), "1,0".to_string())];
        let cmd = restarter.command("127.0.0.1", 39281, &env);

        assert_eq!(
            cmd.args,
            vec![
                "serve",
                "--host",
                "127.0.0.1",
                "--port",
                "39281",
                "--data-dir",
                "/data",
                "--log-level",
                "debug",
                "--quiet",
                "--config-file",
                "/etc/modelvisor.json",
            ]
        );
        assert!(cmd.env.contains(&("CUDA_VISIBLE_DEVICES".to_string(), "1,0".to_string())));
        assert!(
            cmd.env
                .contains(&(ENGINE_PATH_ENV.to_string(), "/data/engines".to_string()))
        );
    }

    #[tokio::test]
    async fn test_restart_succeeds_when_replacement_answers() {
        let port = healthz_server().await;
        let backend = InMemoryProcessBackend::new();
        let restarter = Restarter::new(Arc::new(backend.clone()), options());

        let pid = restarter.restart("0.0.0.0", port, &[]).await.unwrap();
        assert!(backend.is_running(pid));
    }

    #[tokio::test]
    async fn test_restart_fails_closed_when_unreachable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let backend = InMemoryProcessBackend::new();
        let restarter = Restarter::new(Arc::new(backend.clone()), options());

        let err = restarter.restart("127.0.0.1", port, &[]).await.unwrap_err();
        assert!(matches!(
            err,
            HardwareError::RestartUnreachable { attempts: 4, .. }
        ));
        assert!(backend.running_pids().is_empty());
    }

    #[tokio::test]
    async fn test_restart_reports_spawn_failure() {
        let backend = InMemoryProcessBackend::new();
        backend.fail_next_spawn("exec format error");
        let restarter = Restarter::new(Arc::new(backend), options());

        let err = restarter.restart("127.0.0.1", 1, &[]).await.unwrap_err();
        assert!(matches!(err, HardwareError::RestartSpawn(_)));
    }
}
