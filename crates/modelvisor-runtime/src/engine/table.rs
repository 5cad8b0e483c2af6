//! Per-engine model table: records plus port offsets, guarded together.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use modelvisor_core::{ProcessHandle, RunningModel};

use super::transform::TransformTemplates;
use crate::process::PortAllocator;

/// A loaded model's child process.
#[derive(Debug)]
pub struct SubprocessRecord {
    pub model_id: String,
    pub port: u16,
    pub port_offset: u16,
    pub handle: ProcessHandle,
    pub start_time: DateTime<Utc>,
    pub transforms: TransformTemplates,
}

impl SubprocessRecord {
    pub fn describe(&self, engine: &str) -> RunningModel {
        RunningModel {
            id: self.model_id.clone(),
            engine: engine.to_string(),
            port: self.port,
            pid: self.handle.pid(),
            start_time: self.start_time,
        }
    }
}

/// A table entry. `Starting` holds the port while spawn and health checks
/// run outside the lock, so a second load of the same model (or a load of
/// another model) cannot take it.
#[derive(Debug)]
pub enum ModelSlot {
    Starting { port_offset: u16 },
    Running(SubprocessRecord),
}

impl ModelSlot {
    pub const fn port_offset(&self) -> u16 {
        match self {
            Self::Starting { port_offset } => *port_offset,
            Self::Running(record) => record.port_offset,
        }
    }
}

#[derive(Debug)]
pub struct ModelTable {
    pub slots: HashMap<String, ModelSlot>,
    pub ports: PortAllocator,
}

impl ModelTable {
    pub fn new(ports: PortAllocator) -> Self {
        Self {
            slots: HashMap::new(),
            ports,
        }
    }

    /// Drop `model`'s slot and free its port.
    pub fn remove(&mut self, model: &str) -> Option<ModelSlot> {
        let slot = self.slots.remove(model)?;
        self.ports.release(slot.port_offset());
        Some(slot)
    }

    /// Remove a running record only if it still belongs to `pid`.
    pub fn remove_if_pid(&mut self, model: &str, pid: u32) -> Option<SubprocessRecord> {
        match self.slots.get(model) {
            Some(ModelSlot::Running(record)) if record.handle.pid() == pid => {}
            _ => return None,
        }
        match self.remove(model) {
            Some(ModelSlot::Running(record)) => Some(record),
            _ => None,
        }
    }

    pub fn running(&self) -> impl Iterator<Item = &SubprocessRecord> {
        self.slots.values().filter_map(|slot| match slot {
            ModelSlot::Running(record) => Some(record),
            ModelSlot::Starting { .. } => None,
        })
    }
}
