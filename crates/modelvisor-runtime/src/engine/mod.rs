//! Engine adapters.
//!
//! [`SubprocessEngine`] runs one child process per model and relays HTTP to
//! it. In-process engines are built through an [`InProcessRegistry`].

mod in_process;
mod launcher;
mod relay;
mod request;
mod subprocess;
mod table;
mod transform;

pub use in_process::{ENGINE_MODULE, EngineFactory, InProcessContext, InProcessRegistry};
pub use launcher::{
    BackendLauncher, LlamaServerLauncher, PythonLauncher, PythonModelConfig, VllmLauncher,
    executable_name,
};
pub use relay::{STREAM_SENTINEL, relay_stream};
pub use request::{LoadModelRequest, require_model, wants_stream};
pub use subprocess::{SubprocessEngine, SubprocessEngineConfig};
pub use transform::{TransformTemplates, render};
