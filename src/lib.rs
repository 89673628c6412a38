//! A plugin-lifecycle runtime for cloud-native infrastructure agents.
//!
//! Assembles a set of modular plugins, initializes them in dependency order
//! with a bounded startup budget, mirrors a remote key-value store through
//! the datasync broker, and tears everything down on signal or explicit
//! close.

mod agent;
mod config;
mod constants;
mod datasync;
mod errors;
mod kv;
mod plugin;
mod registry;

pub use agent::*;
pub use config::*;
pub use constants::DEFAULT_MICROSERVICE_LABEL;
pub use constants::MICROSERVICE_LABEL_ENV;
pub use datasync::*;
pub use errors::*;
pub use kv::*;
pub use plugin::*;
pub use registry::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
