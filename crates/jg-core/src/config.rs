//! Daemon configuration
//!
//! Loaded from a TOML file: one `[server]` table and a `[targets.<addr>]`
//! table per virtual address. Provider-specific fields are kept as a raw
//! TOML table until the matching provider factory interprets them, so the
//! core schema stays independent of the provider set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// SSH server settings.
    pub server: ServerConfig,

    /// Targets keyed by virtual address.
    #[serde(default)]
    pub targets: HashMap<String, TargetConfig>,
}

/// SSH server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the SSH listener binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path to the host key, PEM format.
    pub host_key: PathBuf,

    /// The single authorized public key, OpenSSH line format.
    pub authorized_key: String,
}

fn default_listen() -> String {
    "localhost:7922".to_string()
}

/// Raw per-target configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Provider type name, resolved against the factory registry.
    #[serde(rename = "type")]
    pub provider: String,

    /// Provider-specific options, interpreted by the factory.
    #[serde(flatten)]
    pub options: toml::Table,
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

/// Helper module for Duration fields serialized as integer seconds.
///
/// Usage: `#[serde(default, with = "jg_core::config::duration_secs")]`.
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a Duration as seconds (u64).
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize a Duration from seconds (u64).
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
