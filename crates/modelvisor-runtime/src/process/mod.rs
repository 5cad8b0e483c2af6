//! Child process supervision.
//!
//! - [`OsProcessBackend`]: real children in their own process group
//! - [`InMemoryProcessBackend`]: simulated children for tests
//! - [`PortAllocator`]: loopback port offsets handed to engine subprocesses

mod memory;
mod os;
mod ports;
mod signal;

pub use memory::InMemoryProcessBackend;
pub use os::OsProcessBackend;
pub use ports::{PortAllocator, is_port_available};
