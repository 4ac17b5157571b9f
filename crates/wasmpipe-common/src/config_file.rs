//! Configuration file structures for wasmpipe.
//!
//! The pipeline is described by a TOML file: engine and execution settings,
//! the serving edge, a default pool section, and the ordered stage list.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{BuilderKind, EngineConfig, ExecutionConfig, PoolConfig, StageSpec};
use crate::error::ConfigError;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [engine]
/// pooling_allocator = true
///
/// [execution]
/// max_fuel = 10_000_000
/// timeout_ms = 1000
///
/// [server]
/// bind_addr = "0.0.0.0:8080"
///
/// [pool]
/// MaxTotal = 8
/// TestOnBorrow = true
///
/// [[stages]]
/// path = "./filters/auth.wasm"
/// builder = "js"
///
/// [[stages]]
/// path = "./filters/rewrite.wasm"
/// builder = "native"
/// [stages.config]
/// prefix = "/api"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-invocation execution limits.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Default pool configuration applied to stages without their own.
    #[serde(default)]
    pub pool: toml::value::Table,

    /// Ordered middleware stages.
    #[serde(default)]
    pub stages: Vec<StageEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Resolve the stage entries into validated [`StageSpec`]s.
    ///
    /// Builder discriminators and pool key maps are validated here, so a
    /// typo fails provisioning instead of being ignored.
    ///
    /// # Errors
    ///
    /// Returns the first builder or pool configuration error encountered.
    pub fn stage_specs(&self) -> Result<Vec<StageSpec>, ConfigError> {
        let default_pool = PoolConfig::from_keys(&self.pool)?;

        self.stages
            .iter()
            .map(|entry| {
                let pool = match &entry.pool {
                    Some(keys) => PoolConfig::from_keys(keys)?,
                    None => default_pool.clone(),
                };
                Ok(StageSpec {
                    path: entry.path.clone(),
                    builder: BuilderKind::parse(&entry.builder)?,
                    guest_config: entry.config.clone(),
                    pool,
                })
            })
            .collect()
    }
}

/// HTTP server configuration from the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
        }
    }
}

/// One stage entry as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageEntry {
    /// Path to the module bytecode.
    pub path: String,

    /// Builder discriminator (`""`/`"native"`/`"go"`, `"js"`/`"asc"`, `"php"`).
    #[serde(default)]
    pub builder: String,

    /// Opaque guest configuration handed to the module.
    #[serde(default)]
    pub config: Option<toml::Value>,

    /// Pool configuration overriding the file-level `[pool]` section.
    #[serde(default)]
    pub pool: Option<toml::value::Table>,
}

/// Default value functions for serde.
mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert!(config.server.graceful_shutdown);
        assert!(config.stages.is_empty());
        assert!(config.stage_specs().unwrap().is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [engine]
            pooling_allocator = false

            [execution]
            max_fuel = 5_000_000
            timeout_ms = 250

            [server]
            bind_addr = "127.0.0.1:9000"
            request_timeout_secs = 10

            [pool]
            MaxTotal = 4
            TestOnBorrow = true

            [[stages]]
            path = "./auth.wasm"
            builder = "js"

            [[stages]]
            path = "./rewrite.wasm"
            builder = "native"
            [stages.config]
            prefix = "/api"
            [stages.pool]
            MaxTotal = 1
            BlockWhenExhausted = false
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();
        assert!(!config.engine.pooling_allocator);
        assert_eq!(config.execution.max_fuel, 5_000_000);
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");

        let specs = config.stage_specs().unwrap();
        assert_eq!(specs.len(), 2);

        assert_eq!(specs[0].builder, BuilderKind::StdioJson);
        assert_eq!(specs[0].pool.max_total, 4);
        assert!(specs[0].pool.test_on_borrow);

        assert_eq!(specs[1].builder, BuilderKind::Native);
        assert!(specs[1].guest_config.is_some());
        assert_eq!(specs[1].pool.max_total, 1);
        assert!(!specs[1].pool.block_when_exhausted);
        // A stage-level pool section replaces the file-level one entirely.
        assert!(!specs[1].pool.test_on_borrow);
    }

    #[test]
    fn test_unknown_pool_key_fails_resolution() {
        let toml = r#"
            [pool]
            Frobnicate = true

            [[stages]]
            path = "./a.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();
        let err = config.stage_specs().unwrap_err();
        assert!(err.to_string().contains("Frobnicate"));
    }

    #[test]
    fn test_unknown_builder_fails_resolution() {
        let toml = r#"
            [[stages]]
            path = "./a.wasm"
            builder = "cobol"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();
        let err = config.stage_specs().unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = ConfigFile::from_toml("this is not valid toml [");
        assert!(result.is_err());
    }
}
