//! Periodic liveness sweep over every resolved subprocess engine.
//!
//! The sweep only looks at process liveness; backend health is probed on
//! demand by `GetModelStatus`. Dead records are purged so their ports can
//! be reused without waiting for a caller to notice.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::EngineCatalog;

pub struct LivenessMonitor {
    catalog: Arc<EngineCatalog>,
    interval: Duration,
    cancel_token: CancellationToken,
}

impl LivenessMonitor {
    pub const fn new(
        catalog: Arc<EngineCatalog>,
        check_interval: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            interval: check_interval,
            cancel_token,
        }
    }

    /// One pass over all engines. Returns the purged model ids.
    pub async fn sweep_once(&self) -> Vec<String> {
        let mut purged = Vec::new();
        for engine in self.catalog.subprocess_engines() {
            purged.extend(engine.sweep_dead().await);
        }
        if !purged.is_empty() {
            info!(models = ?purged, "Purged exited model processes");
        }
        purged
    }

    /// Run until the token is cancelled.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(interval = ?self.interval, "Starting liveness monitor");

            loop {
                tokio::select! {
                    () = self.cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
            debug!("Liveness monitor stopped");
        })
    }
}
