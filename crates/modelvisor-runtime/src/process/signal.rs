//! Process-group signalling.
//!
//! Engine backends fork helpers of their own, so termination always
//! targets the group (Unix) or the process tree (Windows), never just the
//! direct child.

use modelvisor_core::ProcessError;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{Signal, killpg};
#[cfg(unix)]
use nix::unistd::Pid;

/// Signal the group led by `pid`. `force` selects SIGKILL over SIGTERM.
///
/// A group that no longer exists counts as success.
#[cfg(unix)]
pub(super) fn signal_group(pid: u32, force: bool) -> Result<(), ProcessError> {
    let raw = i32::try_from(pid).map_err(|_| ProcessError::SignalFailed {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };

    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::SignalFailed {
            pid,
            reason: e.to_string(),
        }),
    }
}

/// Terminate the process tree rooted at `pid` via `taskkill /T`.
#[cfg(windows)]
pub(super) fn signal_group(pid: u32, force: bool) -> Result<(), ProcessError> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/T", "/PID", &pid.to_string()]);
    if force {
        cmd.arg("/F");
    }

    let output = cmd.output().map_err(|e| ProcessError::SignalFailed {
        pid,
        reason: e.to_string(),
    })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ProcessError::SignalFailed {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
