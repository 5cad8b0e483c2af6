//! `modelvisor` entry point.

use clap::{CommandFactory, Parser};

use modelvisor_cli::logging::init_logging;
use modelvisor_cli::{Cli, CliConfig, Commands, handlers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = CliConfig::from_cli(&cli);
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Commands::Serve { host, port } => {
            handlers::serve::execute(config.with_listen(host, port)).await?;
        }
        Commands::Engines(command) => handlers::engines::execute(config, command).await?,
        Commands::Hardware(command) => handlers::hardware::execute(config, command).await?,
    }
    Ok(())
}
