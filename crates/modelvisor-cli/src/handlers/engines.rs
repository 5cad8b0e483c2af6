//! `modelvisor engines ...`.

use anyhow::Result;

use modelvisor_core::EngineDescriptor;

use crate::bootstrap::{CliConfig, bootstrap};
use crate::commands::EnginesCommand;

pub async fn execute(config: CliConfig, command: EnginesCommand) -> Result<()> {
    let ctx = bootstrap(config).await?;
    match command {
        EnginesCommand::List => {
            println!(
                "{:<16} {:<14} {:<12} {:<12} {:<14} FORMAT",
                "ENGINE", "PRODUCT", "VARIANT", "VERSION", "STATUS"
            );
            for row in ctx.catalog.list_installed() {
                println!("{}", format_row(&row));
            }
        }
        EnginesCommand::Uninstall { name } => {
            ctx.catalog.uninstall(&name)?;
            println!("Engine {name} uninstalled");
        }
    }
    Ok(())
}

fn format_row(row: &EngineDescriptor) -> String {
    format!(
        "{:<16} {:<14} {:<12} {:<12} {:<14} {}",
        row.name,
        row.product_name,
        row.variant.as_deref().unwrap_or("-"),
        row.version.as_deref().unwrap_or("-"),
        row.status.to_string(),
        row.supported_format,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelvisor_core::EngineStatus;

    #[test]
    fn test_format_row_fills_missing_columns() {
        let row = EngineDescriptor {
            name: "vllm".to_string(),
            product_name: "vLLM".to_string(),
            supported_format: "safetensors".to_string(),
            version: None,
            variant: None,
            status: EngineStatus::NotInstalled,
        };
        let line = format_row(&row);
        assert!(line.starts_with("vllm "));
        assert!(line.contains("Not Installed"));
        assert!(line.ends_with("safetensors"));
    }
}
