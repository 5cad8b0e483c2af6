//! `modelvisor hardware ...`.

use anyhow::Result;

use modelvisor_core::ActivationOutcome;

use crate::bootstrap::{CliConfig, bootstrap};
use crate::commands::HardwareCommand;

pub async fn execute(config: CliConfig, command: HardwareCommand) -> Result<()> {
    let ctx = bootstrap(config).await?;
    ctx.hardware.inventory().await?;

    match command {
        HardwareCommand::List => {
            println!(
                "{:<4} {:<44} {:<5} {:<4} {:<9} PRIORITY",
                "ID", "UUID", "TYPE", "HW", "ACTIVATED"
            );
            for record in ctx.hardware.list().await? {
                println!(
                    "{:<4} {:<44} {:<5} {:<4} {:<9} {}",
                    record.software_id,
                    record.uuid,
                    record.kind,
                    record.hardware_id,
                    if record.activated { "yes" } else { "no" },
                    record.priority,
                );
            }
        }
        HardwareCommand::Activate { indices } => {
            match ctx.hardware.set_activation(&indices).await? {
                ActivationOutcome::NoChange => {
                    println!("Activation unchanged");
                }
                ActivationOutcome::RestartRequired(config) => {
                    println!(
                        "Activated devices {:?}; takes effect the next time the server starts",
                        config.selected_device_indices
                    );
                }
            }
        }
    }
    Ok(())
}
