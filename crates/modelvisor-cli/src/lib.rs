//! `modelvisor` command-line interface and server composition root.

#![deny(unsafe_code)]
#![deny(unused_crate_dependencies)]

#[cfg(test)]
use reqwest as _;
#[cfg(test)]
use tokio_test as _;

// Used by the binary only
use dotenvy as _;

pub mod bootstrap;
pub mod commands;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod parser;
pub mod server;

pub use bootstrap::{CliConfig, RuntimeContext, bootstrap};
pub use commands::{Commands, EnginesCommand, HardwareCommand};
pub use parser::Cli;
