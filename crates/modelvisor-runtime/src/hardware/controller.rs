//! Device activation and the restart it triggers.
//!
//! Activation is persisted per device and only applied to engine processes
//! through the environment of a fresh server instance. A change made while
//! running is held as pending until [`HardwareController::restart`]
//! succeeds; if the restart fails the change stays persisted and takes
//! effect on the next natural start.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use modelvisor_core::{
    ActivationConfig, ActivationOutcome, ComputeDevice, DeviceKind, DeviceProbe, HardwareError,
    HardwareRecord, HardwareRepository, ProcessEnvironment, RestartOutcome,
};

use super::restart::Restarter;

pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
pub const VULKAN_VISIBLE_DEVICES: &str = "GGML_VK_VISIBLE_DEVICES";

/// Visible-device variables for `activated`, which must already be in
/// priority order. CUDA numbers devices by hardware id, Vulkan by
/// software id.
pub fn visible_devices_env(activated: &[HardwareRecord]) -> Vec<(String, String)> {
    let gpus: Vec<&HardwareRecord> = activated
        .iter()
        .filter(|r| r.activated && r.kind == DeviceKind::Gpu)
        .collect();
    let join = |ids: Vec<i64>| {
        ids.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    };

    vec![
        (
            CUDA_VISIBLE_DEVICES.to_string(),
            join(gpus.iter().map(|r| r.hardware_id).collect()),
        ),
        (
            VULKAN_VISIBLE_DEVICES.to_string(),
            join(gpus.iter().map(|r| r.software_id).collect()),
        ),
    ]
}

fn activated_in_order(records: &[HardwareRecord]) -> Vec<HardwareRecord> {
    let mut activated: Vec<HardwareRecord> =
        records.iter().filter(|r| r.activated).cloned().collect();
    activated.sort_by_key(|r| (r.priority, r.software_id));
    activated
}

pub struct HardwareController {
    repo: Arc<dyn HardwareRepository>,
    probe: Arc<dyn DeviceProbe>,
    env: ProcessEnvironment,
    restarter: Restarter,
    pending: Mutex<Option<ActivationConfig>>,
}

impl HardwareController {
    pub fn new(
        repo: Arc<dyn HardwareRepository>,
        probe: Arc<dyn DeviceProbe>,
        env: ProcessEnvironment,
        restarter: Restarter,
    ) -> Self {
        Self {
            repo,
            probe,
            env,
            restarter,
            pending: Mutex::new(None),
        }
    }

    /// Probe devices, reconcile the persisted table and return the
    /// activated devices in priority order.
    ///
    /// With no change pending, the activation is also published to the
    /// environment used for engine processes.
    pub async fn inventory(&self) -> Result<Vec<HardwareRecord>, HardwareError> {
        let probe = Arc::clone(&self.probe);
        let devices = tokio::task::spawn_blocking(move || probe.enumerate())
            .await
            .map_err(|e| HardwareError::Probe(e.to_string()))?;
        debug!(count = devices.len(), "Probed compute devices");

        let records = self.reconcile(&devices).await?;
        let activated = activated_in_order(&records);
        if self.pending.lock().await.is_none() {
            self.apply_environment(&activated);
        }
        Ok(activated)
    }

    async fn reconcile(
        &self,
        devices: &[ComputeDevice],
    ) -> Result<Vec<HardwareRecord>, HardwareError> {
        let existing = self.repo.list().await?;
        let sole_discrete = devices.iter().filter(|d| d.discrete).count() == 1;
        let mut next_priority = existing.iter().map(|r| r.priority).max().map_or(0, |p| p + 1);

        for device in devices {
            match existing.iter().find(|r| r.uuid == device.uuid) {
                Some(record) => {
                    if record.hardware_id != device.hardware_id
                        || record.software_id != device.software_id
                        || record.kind != device.kind
                    {
                        let updated = HardwareRecord {
                            kind: device.kind,
                            hardware_id: device.hardware_id,
                            software_id: device.software_id,
                            ..record.clone()
                        };
                        self.repo.upsert(&updated).await?;
                    }
                }
                None => {
                    let record = HardwareRecord {
                        uuid: device.uuid.clone(),
                        kind: device.kind,
                        hardware_id: device.hardware_id,
                        software_id: device.software_id,
                        activated: sole_discrete && device.discrete,
                        priority: next_priority,
                    };
                    next_priority += 1;
                    info!(uuid = %record.uuid, name = %device.name, activated = record.activated, "New compute device");
                    self.repo.upsert(&record).await?;
                }
            }
        }

        for record in &existing {
            if !devices.iter().any(|d| d.uuid == record.uuid) {
                info!(uuid = %record.uuid, "Compute device no longer present");
                self.repo.remove(&record.uuid).await?;
            }
        }

        Ok(self.repo.list().await?)
    }

    fn apply_environment(&self, activated: &[HardwareRecord]) {
        for (key, value) in visible_devices_env(activated) {
            if value.is_empty() {
                self.env.remove(&key);
            } else {
                self.env.set(key, value);
            }
        }
    }

    /// Persisted rows, ordered by priority.
    pub async fn list(&self) -> Result<Vec<HardwareRecord>, HardwareError> {
        Ok(self.repo.list().await?)
    }

    /// Activate devices by software id, in priority order.
    ///
    /// Unknown ids are dropped; if none remain the request is rejected.
    pub async fn set_activation(
        &self,
        requested: &[i64],
    ) -> Result<ActivationOutcome, HardwareError> {
        let records = self.repo.list().await?;

        let mut selected: Vec<i64> = Vec::new();
        for id in requested {
            if records.iter().any(|r| r.software_id == *id) && !selected.contains(id) {
                selected.push(*id);
            }
        }
        if selected.is_empty() {
            return Err(HardwareError::InvalidActivationConfig(requested.to_vec()));
        }

        let current: Vec<i64> = activated_in_order(&records)
            .iter()
            .map(|r| r.software_id)
            .collect();
        if current == selected {
            debug!(devices = ?selected, "Activation unchanged");
            return Ok(ActivationOutcome::NoChange);
        }

        let mut rest: Vec<&HardwareRecord> = records
            .iter()
            .filter(|r| !selected.contains(&r.software_id))
            .collect();
        rest.sort_by_key(|r| (r.priority, r.software_id));

        for (priority, id) in (0_i64..).zip(&selected) {
            if let Some(record) = records.iter().find(|r| r.software_id == *id) {
                self.repo
                    .upsert(&HardwareRecord {
                        activated: true,
                        priority,
                        ..record.clone()
                    })
                    .await?;
            }
        }
        let offset = i64::try_from(selected.len()).unwrap_or(i64::MAX);
        for (i, record) in (0_i64..).zip(rest) {
            self.repo
                .upsert(&HardwareRecord {
                    activated: false,
                    priority: offset + i,
                    ..record.clone()
                })
                .await?;
        }

        let config = ActivationConfig::new(selected);
        info!(devices = ?config.selected_device_indices, "Activation changed, restart required");
        *self.pending.lock().await = Some(config.clone());
        Ok(ActivationOutcome::RestartRequired(config))
    }

    pub async fn is_restart_pending(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    pub async fn pending(&self) -> Option<ActivationConfig> {
        self.pending.lock().await.clone()
    }

    /// Replace this server with one using the pending activation.
    ///
    /// On `Replaced` the caller must exit. On error the current instance
    /// keeps running and the change stays pending.
    pub async fn restart(&self, host: &str, port: u16) -> Result<RestartOutcome, HardwareError> {
        let mut pending = self.pending.lock().await;
        if pending.is_none() {
            return Ok(RestartOutcome::NotNeeded);
        }

        let activated = activated_in_order(&self.repo.list().await?);
        let env = visible_devices_env(&activated);
        match self.restarter.restart(host, port, &env).await {
            Ok(pid) => {
                *pending = None;
                Ok(RestartOutcome::Replaced { pid })
            }
            Err(e) => {
                warn!(error = %e, "Restart failed, keeping current instance");
                Err(e)
            }
        }
    }
}
