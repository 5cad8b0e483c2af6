//! `modelvisor serve`.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use modelvisor_runtime::LivenessMonitor;

use crate::bootstrap::{CliConfig, bootstrap};
use crate::server::{ServeExit, serve};

pub async fn execute(config: CliConfig) -> Result<()> {
    let quiet = config.quiet;
    let ctx = bootstrap(config).await?;

    let activated = ctx.hardware.inventory().await?;
    info!(
        devices = ?activated.iter().map(|r| r.software_id).collect::<Vec<_>>(),
        "Activated compute devices"
    );

    let monitor = LivenessMonitor::new(
        Arc::clone(&ctx.catalog),
        ctx.settings.liveness_interval(),
        ctx.shutdown.child_token(),
    )
    .spawn();

    tokio::spawn({
        let shutdown = ctx.shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
            }
            shutdown.cancel();
        }
    });

    let exit = serve(
        Arc::clone(&ctx.hardware),
        ctx.host(),
        ctx.port(),
        &ctx.shutdown,
        quiet,
    )
    .await;

    ctx.shutdown.cancel();
    if let Err(e) = monitor.await {
        warn!(error = %e, "Liveness monitor task failed");
    }
    ctx.catalog.shutdown().await;

    match exit? {
        ServeExit::Shutdown => info!("Server stopped"),
        ServeExit::Replaced { pid } => info!(pid, "Handed over to replacement server"),
    }
    Ok(())
}
