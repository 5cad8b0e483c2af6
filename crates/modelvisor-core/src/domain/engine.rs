//! Engine catalog and running-model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Installation state of an engine variant on this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// The variant directory exists and the engine can be resolved.
    Ready,
    /// The engine is known but no variant is installed.
    NotInstalled,
    /// The engine cannot run on this OS/architecture, installed or not.
    Incompatible,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ready => "Ready",
            Self::NotInstalled => "Not Installed",
            Self::Incompatible => "Incompatible",
        };
        f.write_str(label)
    }
}

/// How an engine serves models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Native code loaded into the server process.
    InProcess,
    /// One child process per model, reached over loopback HTTP.
    Subprocess,
}

/// One row of the installed-engines listing.
///
/// Produced by scanning the engines directory; never mutated at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    pub name: String,
    pub product_name: String,
    pub supported_format: String,
    pub version: Option<String>,
    pub variant: Option<String>,
    pub status: EngineStatus,
}

/// A model currently served by a subprocess engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningModel {
    pub id: String,
    pub engine: String,
    pub port: u16,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
}
