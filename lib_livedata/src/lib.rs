//! # lib_livedata
//!
//! Live data distribution engine shared by the workspace binaries.
//!
//! - `core`: the engine (dispatcher, lists, owners, router, references, trees).
//! - `configs`: runtime settings and definition files.
//! - `loggers`: log sink installation.

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "loggers")]
pub mod loggers;

// Re-export the most used entry points
#[cfg(feature = "core")]
pub use crate::core::{Broadcast, LiveContext, Record, Scope, TypeTag};

#[cfg(feature = "configs")]
pub use configs::{config_sys::EngineConfig, definitions::DefinitionsFile, ConfigError};

#[cfg(feature = "loggers")]
pub use loggers::logger::setup_logging;
