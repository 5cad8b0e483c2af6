//! Root CLI parser and global options.

use clap::Parser;
use std::path::PathBuf;

use modelvisor_core::DATA_DIR_ENV;

use crate::commands::Commands;

#[derive(Parser, Debug)]
#[command(name = "modelvisor")]
#[command(about = "Run and supervise local inference engines")]
#[command(version)]
pub struct Cli {
    /// Server settings file (JSON)
    #[arg(long = "config-file", global = true, env = "MODELVISOR_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Data directory for engines, logs and the database
    #[arg(long = "data-dir", global = true, env = DATA_DIR_ENV)]
    pub data_dir: Option<PathBuf>,

    /// Log filter directive, e.g. `info` or `modelvisor_runtime=debug`
    #[arg(long = "log-level", global = true, default_value = "info")]
    pub log_level: String,

    /// Suppress console banners
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}
