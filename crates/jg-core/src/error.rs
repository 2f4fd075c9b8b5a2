//! Core error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading the configuration file.
///
/// These are converted into [`crate::diag::Diagnostics`] at the CLI edge
/// so they print alongside schema-level problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file does not exist.
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    /// The config file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML, or violates the schema. TOML
    /// itself rejects duplicate `[targets.X]` tables, so duplicate virtual
    /// addresses surface here.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
