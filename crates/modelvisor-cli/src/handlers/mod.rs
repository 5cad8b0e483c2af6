//! Command handlers.

pub mod engines;
pub mod hardware;
pub mod serve;
