//! Simulated process backend.
//!
//! Spawns nothing: each "process" is an in-memory flag that tests can
//! crash, and that `terminate` flips to exited. Lets engine logic be
//! exercised without touching the OS.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

use modelvisor_core::{LaunchCommand, ProcessBackend, ProcessControl, ProcessError, ProcessHandle};

const FIRST_PID: u32 = 10_000;

#[derive(Debug)]
struct SimulatedProcess {
    exited: watch::Sender<bool>,
    ignore_terminate: AtomicBool,
    terminations: AtomicUsize,
}

impl SimulatedProcess {
    fn new() -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            exited,
            ignore_terminate: AtomicBool::new(false),
            terminations: AtomicUsize::new(0),
        }
    }

    fn exit(&self) {
        self.exited.send_replace(true);
    }

    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

#[derive(Debug)]
struct SimulatedControl {
    pid: u32,
    process: Arc<SimulatedProcess>,
}

#[async_trait]
impl ProcessControl for SimulatedControl {
    fn has_exited(&self) -> bool {
        self.process.has_exited()
    }

    async fn wait(&self) -> Result<Option<i32>, ProcessError> {
        let mut rx = self.process.exited.subscribe();
        rx.wait_for(|exited| *exited)
            .await
            .map(|_| ())
            .map_err(|e| ProcessError::WaitFailed {
                pid: self.pid,
                reason: e.to_string(),
            })?;
        Ok(Some(0))
    }

    fn terminate(&self) -> Result<(), ProcessError> {
        self.process.terminations.fetch_add(1, Ordering::SeqCst);
        if !self.process.ignore_terminate.load(Ordering::SeqCst) {
            self.process.exit();
        }
        Ok(())
    }

    fn force_kill(&self) -> Result<(), ProcessError> {
        self.process.exit();
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryState {
    next_pid: u32,
    spawned: Vec<LaunchCommand>,
    processes: HashMap<u32, Arc<SimulatedProcess>>,
    fail_next: Option<String>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            next_pid: FIRST_PID,
            spawned: Vec::new(),
            processes: HashMap::new(),
            fail_next: None,
        }
    }
}

/// In-memory [`ProcessBackend`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProcessBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next spawn fail with `reason`.
    pub fn fail_next_spawn(&self, reason: impl Into<String>) {
        self.lock().fail_next = Some(reason.into());
    }

    /// Commands spawned so far, in order.
    pub fn spawned(&self) -> Vec<LaunchCommand> {
        self.lock().spawned.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.lock().spawned.len()
    }

    /// Simulate `pid` dying on its own.
    pub fn crash(&self, pid: u32) {
        if let Some(process) = self.lock().processes.get(&pid) {
            process.exit();
        }
    }

    /// Make `pid` ignore graceful termination (only force kill works).
    pub fn ignore_terminate(&self, pid: u32) {
        if let Some(process) = self.lock().processes.get(&pid) {
            process.ignore_terminate.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.lock()
            .processes
            .get(&pid)
            .is_some_and(|p| !p.has_exited())
    }

    /// Pids that have not exited, ascending.
    pub fn running_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .lock()
            .processes
            .iter()
            .filter(|(_, p)| !p.has_exited())
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    pub fn termination_requests(&self, pid: u32) -> usize {
        self.lock()
            .processes
            .get(&pid)
            .map_or(0, |p| p.terminations.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl ProcessBackend for InMemoryProcessBackend {
    async fn spawn(&self, command: &LaunchCommand) -> Result<ProcessHandle, ProcessError> {
        let mut state = self.lock();
        if let Some(reason) = state.fail_next.take() {
            return Err(ProcessError::SpawnFailed {
                program: command.program.display().to_string(),
                reason,
            });
        }

        let pid = state.next_pid;
        state.next_pid += 1;
        let process = Arc::new(SimulatedProcess::new());
        state.processes.insert(pid, Arc::clone(&process));
        state.spawned.push(command.clone());
        drop(state);

        Ok(
            ProcessHandle::new(pid, Arc::new(SimulatedControl { pid, process }))
                .with_output(command.stdout.clone(), command.stderr.clone()),
        )
    }
}
