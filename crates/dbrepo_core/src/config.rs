//! Engine and logging configuration.
//!
//! # Responsibility
//! - Describe store engines and logging in a serde-friendly shape.
//! - Load that description from JSON text or files.
//!
//! # Invariants
//! - Parsing never validates engine names; `EngineRegistry::from_config`
//!   owns the `default` engine invariant.

use crate::logging::default_log_level;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Engines keyed by logical name; must include `default`.
    pub engines: BTreeMap<String, EngineConfig>,
    /// Optional logging setup applied by executables.
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

/// One store engine description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum EngineConfig {
    /// SQLite database file.
    Sqlite {
        path: PathBuf,
        #[serde(default = "default_busy_timeout_ms")]
        busy_timeout_ms: u64,
        #[serde(default = "default_foreign_keys")]
        foreign_keys: bool,
    },
    /// Process-local in-memory engine.
    Memory,
}

/// Logging setup. A missing `log_dir` logs to stderr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            log_dir: None,
        }
    }
}

impl StoreConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(ConfigError::Parse)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config: {err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_foreign_keys() -> bool {
    true
}

fn default_level() -> String {
    default_log_level().to_string()
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, EngineConfig, StoreConfig};
    use crate::error::TxError;
    use crate::registry::EngineRegistry;
    use std::path::PathBuf;

    #[test]
    fn parses_engines_with_defaults() {
        let config = StoreConfig::from_json_str(
            r#"{
                "engines": {
                    "default": { "driver": "sqlite", "path": "/tmp/app.db" },
                    "scratch": { "driver": "memory" }
                },
                "logging": { "level": "warn" }
            }"#,
        )
        .expect("config should parse");

        assert_eq!(
            config.engines["default"],
            EngineConfig::Sqlite {
                path: PathBuf::from("/tmp/app.db"),
                busy_timeout_ms: 5_000,
                foreign_keys: true,
            }
        );
        assert_eq!(config.engines["scratch"], EngineConfig::Memory);
        let logging = config.logging.expect("logging section");
        assert_eq!(logging.level, "warn");
        assert!(logging.log_dir.is_none());
    }

    #[test]
    fn rejects_unknown_driver_and_fields() {
        let err = StoreConfig::from_json_str(r#"{"engines":{"default":{"driver":"oracle"}}}"#)
            .expect_err("unknown driver");
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = StoreConfig::from_json_str(r#"{"engines":{},"pool":4}"#)
            .expect_err("unknown field");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn registry_from_config_enforces_default_engine() {
        let config = StoreConfig::from_json_str(r#"{"engines":{"reports":{"driver":"memory"}}}"#)
            .expect("config should parse");
        let err = EngineRegistry::from_config(&config).expect_err("default engine missing");
        assert!(matches!(err, TxError::EngineNotFound(_)));

        let config = StoreConfig::from_json_str(r#"{"engines":{"default":{"driver":"memory"}}}"#)
            .expect("config should parse");
        let registry = EngineRegistry::from_config(&config).expect("registry");
        assert_eq!(registry.names(), vec!["default"]);
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("absent.json");
        let err = StoreConfig::from_path(&path).expect_err("missing file");
        assert!(err.to_string().contains("absent.json"));
    }
}
