//! Operating-system process backend.

use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use modelvisor_core::{
    LaunchCommand, ProcessBackend, ProcessControl, ProcessEnvironment, ProcessError, ProcessHandle,
};

use super::signal::signal_group;

/// Spawns real children with the shared environment overlay applied.
///
/// On Unix every child leads its own process group so the whole tree can
/// be signalled at once, and so it survives the server exiting (the
/// restart protocol depends on this).
#[derive(Debug, Clone, Default)]
pub struct OsProcessBackend {
    env: ProcessEnvironment,
}

impl OsProcessBackend {
    pub const fn new(env: ProcessEnvironment) -> Self {
        Self { env }
    }
}

fn open_redirect(path: Option<&Path>) -> Result<Stdio, ProcessError> {
    let Some(path) = path else {
        return Ok(Stdio::null());
    };
    let redirect_err = |e: std::io::Error| ProcessError::Redirect {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(redirect_err)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(redirect_err)?;
    Ok(Stdio::from(file))
}

#[async_trait]
impl ProcessBackend for OsProcessBackend {
    async fn spawn(&self, command: &LaunchCommand) -> Result<ProcessHandle, ProcessError> {
        let program = command.program.display().to_string();
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in self.env.snapshot() {
            cmd.env(key, value);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(open_redirect(command.stdout.as_deref())?)
            .stderr(open_redirect(command.stderr.as_deref())?);

        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            program: program.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
            program: program.clone(),
            reason: "process exited before a pid was assigned".to_string(),
        })?;

        info!(pid, command = %command.display(), "Spawned process");

        let control = OsProcessControl::start(pid, child);
        Ok(ProcessHandle::new(pid, Arc::new(control))
            .with_output(command.stdout.clone(), command.stderr.clone()))
    }
}

#[derive(Debug, Clone, Copy)]
enum ExitState {
    Exited(Option<i32>),
    WaitFailed,
}

/// Control over one OS child.
///
/// A reaper task owns the `Child` and publishes its exit through a watch
/// channel, which keeps liveness checks non-blocking and lock-free.
#[derive(Debug)]
struct OsProcessControl {
    pid: u32,
    exit: watch::Receiver<Option<ExitState>>,
}

impl OsProcessControl {
    fn start(pid: u32, mut child: tokio::process::Child) -> Self {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let state = match child.wait().await {
                Ok(status) => {
                    debug!(pid, %status, "Reaped child process");
                    ExitState::Exited(status.code())
                }
                Err(e) => {
                    warn!(pid, error = %e, "Failed to reap child process");
                    ExitState::WaitFailed
                }
            };
            let _ = tx.send(Some(state));
        });
        Self { pid, exit: rx }
    }
}

#[async_trait]
impl ProcessControl for OsProcessControl {
    fn has_exited(&self) -> bool {
        // A dropped sender means the reaper is gone with the runtime.
        self.exit.borrow().is_some() || self.exit.has_changed().is_err()
    }

    async fn wait(&self) -> Result<Option<i32>, ProcessError> {
        let mut rx = self.exit.clone();
        let state = rx
            .wait_for(Option::is_some)
            .await
            .map(|state| *state)
            .map_err(|e| ProcessError::WaitFailed {
                pid: self.pid,
                reason: e.to_string(),
            })?;

        match state {
            Some(ExitState::Exited(code)) => Ok(code),
            _ => Err(ProcessError::WaitFailed {
                pid: self.pid,
                reason: "reaper could not collect exit status".to_string(),
            }),
        }
    }

    fn terminate(&self) -> Result<(), ProcessError> {
        debug!(pid = self.pid, "Sending graceful termination to process group");
        signal_group(self.pid, false)
    }

    fn force_kill(&self) -> Result<(), ProcessError> {
        debug!(pid = self.pid, "Force killing process group");
        signal_group(self.pid, true)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::sleep;

    fn shell(script: &str) -> LaunchCommand {
        LaunchCommand::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn spawn_missing_executable_is_typed_failure() {
        let backend = OsProcessBackend::default();
        let result = backend
            .spawn(&LaunchCommand::new("/nonexistent/modelvisor-backend"))
            .await;
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn kill_terminates_running_child() {
        let backend = OsProcessBackend::default();
        let handle = backend
            .spawn(&LaunchCommand::new("sleep").arg("30"))
            .await
            .expect("failed to spawn sleep");

        assert!(handle.is_alive());
        assert!(handle.kill());
        assert!(handle.wait().await);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn exited_child_reports_dead() {
        let backend = OsProcessBackend::default();
        let handle = backend.spawn(&shell("exit 3")).await.unwrap();

        assert!(handle.wait().await);
        assert!(!handle.is_alive());
        assert!(handle.kill());
    }

    #[tokio::test]
    async fn output_is_redirected_with_overlay_env() {
        let temp = tempdir().unwrap();
        let log = temp.path().join("logs").join("child.log");
        let env = ProcessEnvironment::new();
        env.set("MODELVISOR_TEST_VALUE", "from-overlay");

        let backend = OsProcessBackend::new(env);
        let handle = backend
            .spawn(&shell("echo $MODELVISOR_TEST_VALUE; echo oops >&2").log_to(&log))
            .await
            .unwrap();
        assert!(handle.wait().await);

        let contents = fs::read_to_string(&log).unwrap();
        assert!(contents.contains("from-overlay"));
        assert!(contents.contains("oops"));
        assert_eq!(handle.stdout_path(), Some(log.as_path()));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kill_reaches_grandchildren() {
        let temp = tempdir().unwrap();
        let pid_file = temp.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

        let backend = OsProcessBackend::default();
        let handle = backend.spawn(&shell(&script)).await.unwrap();

        let mut grandchild = None;
        for _ in 0..50 {
            if let Ok(raw) = fs::read_to_string(&pid_file)
                && let Ok(pid) = raw.trim().parse::<u32>()
            {
                grandchild = Some(pid);
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        let grandchild = grandchild.expect("grandchild pid not written");

        assert!(handle.shutdown(Duration::from_secs(5)).await);

        // Gone or a zombie awaiting its new parent.
        let mut running = true;
        for _ in 0..50 {
            let stat = fs::read_to_string(format!("/proc/{grandchild}/stat")).unwrap_or_default();
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next());
            if stat.is_empty() || state == Some('Z') {
                running = false;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(!running, "grandchild {grandchild} survived group kill");
    }
}
