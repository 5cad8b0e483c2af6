//! Subcommand definitions.

use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the server
    Serve {
        /// Address to bind (overrides the settings file)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind; model backends use the ports above it
        #[arg(long)]
        port: Option<u16>,
    },

    /// Inspect or remove installed engines
    #[command(subcommand)]
    Engines(EnginesCommand),

    /// Inspect or change compute device activation
    #[command(subcommand)]
    Hardware(HardwareCommand),
}

#[derive(Subcommand, Debug)]
pub enum EnginesCommand {
    /// List known engines and installed variants
    List,
    /// Delete every installed variant of an engine
    Uninstall {
        /// Engine name, e.g. `llama-cpp`
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum HardwareCommand {
    /// Probe devices and show their activation
    List,
    /// Activate devices by index, highest priority first
    Activate {
        #[arg(required = true)]
        indices: Vec<i64>,
    },
}
