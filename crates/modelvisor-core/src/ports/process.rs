//! Process supervision port.
//!
//! A [`ProcessBackend`] turns a [`LaunchCommand`] into a running child and
//! hands back a [`ProcessHandle`]. The handle is the only way to observe or
//! stop the child; each platform (and the in-memory test backend) supplies
//! its own [`ProcessControl`] behind it.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::ProcessError;
use crate::domain::LaunchCommand;

/// Platform-specific control over one spawned process group.
#[async_trait]
pub trait ProcessControl: Send + Sync + fmt::Debug {
    /// Non-blocking exit check.
    fn has_exited(&self) -> bool;

    /// Wait for the process to exit, returning its exit code when known.
    async fn wait(&self) -> Result<Option<i32>, ProcessError>;

    /// Ask the whole process group to terminate (SIGTERM or equivalent).
    fn terminate(&self) -> Result<(), ProcessError>;

    /// Forcefully kill the whole process group.
    fn force_kill(&self) -> Result<(), ProcessError>;
}

/// Spawns child processes.
#[async_trait]
pub trait ProcessBackend: Send + Sync + fmt::Debug {
    /// Start `command`. Failures to start are returned here; a process that
    /// started and then died is reported later through [`ProcessHandle::is_alive`].
    async fn spawn(&self, command: &LaunchCommand) -> Result<ProcessHandle, ProcessError>;
}

/// Handle to a spawned child.
///
/// Not `Clone`: exactly one owner (normally a model record) holds it. The
/// terminated flag only ever moves from `false` to `true`.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    control: Arc<dyn ProcessControl>,
    terminated: AtomicBool,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
}

impl ProcessHandle {
    pub fn new(pid: u32, control: Arc<dyn ProcessControl>) -> Self {
        Self {
            pid,
            control,
            terminated: AtomicBool::new(false),
            stdout: None,
            stderr: None,
        }
    }

    /// Record where the child's output streams were redirected.
    #[must_use]
    pub fn with_output(mut self, stdout: Option<PathBuf>, stderr: Option<PathBuf>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn stdout_path(&self) -> Option<&Path> {
        self.stdout.as_deref()
    }

    pub fn stderr_path(&self) -> Option<&Path> {
        self.stderr.as_deref()
    }

    /// Whether the handle has observed the child's exit.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Non-blocking liveness check. Never fails; once death is observed the
    /// handle stays terminated and later calls return immediately.
    pub fn is_alive(&self) -> bool {
        if self.is_terminated() {
            return false;
        }
        if self.control.has_exited() {
            self.mark_terminated();
            return false;
        }
        true
    }

    /// Wait for the child to exit. Returns `false` if waiting failed.
    pub async fn wait(&self) -> bool {
        match self.control.wait().await {
            Ok(code) => {
                debug!(pid = self.pid, ?code, "Process exited");
                self.mark_terminated();
                true
            }
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Failed to wait for process");
                false
            }
        }
    }

    /// Send a graceful termination request to the child's process group.
    ///
    /// The group is signalled even after the leader has exited, so helpers
    /// it forked are not left behind. Returns `true` if the request was
    /// delivered or the leader is already gone.
    pub fn kill(&self) -> bool {
        let leader_alive = self.is_alive();
        match self.control.terminate() {
            Ok(()) => true,
            Err(e) if !leader_alive => {
                debug!(pid = self.pid, error = %e, "Process group already gone");
                true
            }
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Failed to terminate process group");
                false
            }
        }
    }

    /// Terminate, wait up to `grace`, then force-kill and reap.
    ///
    /// Returns `true` once the child has been reaped.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if self.kill()
            && let Ok(reaped) = timeout(grace, self.wait()).await
            && reaped
        {
            return true;
        }

        debug!(pid = self.pid, "Grace period elapsed, force killing process group");
        if let Err(e) = self.control.force_kill() {
            warn!(pid = self.pid, error = %e, "Failed to force kill process group");
            return false;
        }
        timeout(grace, self.wait()).await.unwrap_or(false)
    }

    fn mark_terminated(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            debug!(pid = self.pid, "Process marked terminated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct CountingControl {
        exited: AtomicBool,
        exit_checks: AtomicUsize,
        terminations: AtomicUsize,
        group_gone: AtomicBool,
    }

    #[async_trait]
    impl ProcessControl for CountingControl {
        fn has_exited(&self) -> bool {
            self.exit_checks.fetch_add(1, Ordering::SeqCst);
            self.exited.load(Ordering::SeqCst)
        }

        async fn wait(&self) -> Result<Option<i32>, ProcessError> {
            self.exited.store(true, Ordering::SeqCst);
            Ok(Some(0))
        }

        fn terminate(&self) -> Result<(), ProcessError> {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            self.exited.store(true, Ordering::SeqCst);
            if self.group_gone.load(Ordering::SeqCst) {
                return Err(ProcessError::SignalFailed {
                    pid: 0,
                    reason: "no such process group".into(),
                });
            }
            Ok(())
        }

        fn force_kill(&self) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    #[test]
    fn death_is_sticky_and_cheap() {
        let control = Arc::new(CountingControl::default());
        let handle = ProcessHandle::new(42, control.clone());

        assert!(handle.is_alive());
        control.exited.store(true, Ordering::SeqCst);
        assert!(!handle.is_alive());
        assert!(handle.is_terminated());

        let checks = control.exit_checks.load(Ordering::SeqCst);
        assert!(!handle.is_alive());
        assert_eq!(control.exit_checks.load(Ordering::SeqCst), checks);
    }

    #[test]
    fn kill_still_signals_group_after_leader_exit() {
        let control = Arc::new(CountingControl::default());
        let handle = ProcessHandle::new(7, control.clone());

        assert!(handle.kill());
        assert_eq!(control.terminations.load(Ordering::SeqCst), 1);
        assert!(!handle.is_alive());
        assert!(handle.kill());
        assert_eq!(control.terminations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn kill_failure_on_dead_leader_counts_as_success() {
        let control = Arc::new(CountingControl::default());
        control.exited.store(true, Ordering::SeqCst);
        control.group_gone.store(true, Ordering::SeqCst);
        let handle = ProcessHandle::new(8, control.clone());

        assert!(handle.kill());
        assert_eq!(control.terminations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn kill_failure_on_live_leader_is_reported() {
        let control = Arc::new(CountingControl::default());
        control.group_gone.store(true, Ordering::SeqCst);
        let handle = ProcessHandle::new(10, control);

        assert!(!handle.kill());
    }

    #[tokio::test]
    async fn shutdown_reaps_within_grace() {
        let control = Arc::new(CountingControl::default());
        let handle = ProcessHandle::new(9, control);
        assert!(handle.shutdown(Duration::from_millis(50)).await);
        assert!(handle.is_terminated());
    }
}
