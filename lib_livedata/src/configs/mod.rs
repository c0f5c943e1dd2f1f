//! # Configuration Modules
//!
//! Runtime settings for the engine binaries and the definition files the
//! engine is built from.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::ContextError;

/// Runtime settings: defaults, JSON config file, env vars and CLI flags.
pub mod config_sys;

/// Type, data source, reference and tree definitions.
pub mod definitions;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A file is not valid JSON for its schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// The file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// A setting has an unusable value.
    #[error("invalid setting {name}: {reason}")]
    Invalid {
        /// Setting name.
        name: &'static str,
        /// Why it was refused.
        reason: String,
    },
    /// The definitions were rejected by the engine.
    #[error(transparent)]
    Context(#[from] ContextError),
}
