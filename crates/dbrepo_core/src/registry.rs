//! Named store engine registry.
//!
//! # Responsibility
//! - Map logical engine names to engine handles.
//! - Open sessions by engine name for transaction contexts.
//!
//! # Invariants
//! - A `default` engine is always registered.
//! - The registry is immutable after construction and shared read-only
//!   (`Arc<EngineRegistry>`) by every context.

use crate::config::{EngineConfig, StoreConfig};
use crate::error::{TxError, TxResult};
use crate::store::memory::MemoryEngine;
use crate::store::sqlite::SqliteEngine;
use crate::store::{EngineHandle, Session};
use log::{debug, error};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Name of the engine used when no engine is named.
pub const DEFAULT_ENGINE: &str = "default";

/// Immutable engine name to handle mapping.
pub struct EngineRegistry {
    engines: BTreeMap<String, Arc<dyn EngineHandle>>,
    default_engine: Arc<dyn EngineHandle>,
}

impl EngineRegistry {
    /// Builds a registry from `(name, engine)` pairs.
    ///
    /// # Errors
    /// - `InvalidEngineName` / `DuplicateEngineName` for bad entries.
    /// - `EngineNotFound("default")` when no default engine is supplied.
    pub fn new<I, N>(engines: I) -> TxResult<Self>
    where
        I: IntoIterator<Item = (N, Arc<dyn EngineHandle>)>,
        N: Into<String>,
    {
        let mut builder = Self::builder();
        for (name, engine) in engines {
            builder = builder.shared_engine(name, engine);
        }
        builder.build()
    }

    pub fn builder() -> EngineRegistryBuilder {
        EngineRegistryBuilder::default()
    }

    /// Builds engines described by configuration.
    pub fn from_config(config: &StoreConfig) -> TxResult<Self> {
        let mut builder = Self::builder();
        for (name, engine) in &config.engines {
            builder = match engine {
                EngineConfig::Sqlite {
                    path,
                    busy_timeout_ms,
                    foreign_keys,
                } => builder.engine(
                    name.as_str(),
                    SqliteEngine::new(path)
                        .with_busy_timeout(Duration::from_millis(*busy_timeout_ms))
                        .with_foreign_keys(*foreign_keys),
                ),
                EngineConfig::Memory => builder.engine(name.as_str(), MemoryEngine::new()),
            };
        }
        builder.build()
    }

    /// Returns one engine by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn EngineHandle>> {
        self.engines.get(name.trim()).cloned()
    }

    pub fn default_engine(&self) -> Arc<dyn EngineHandle> {
        Arc::clone(&self.default_engine)
    }

    /// Returns sorted engine names.
    pub fn names(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Opens a new session on `name`; a blank name selects the default engine.
    pub fn open_session(&self, name: &str) -> TxResult<Box<dyn Session>> {
        let resolved = resolve_engine_name(name);
        let engine = self
            .lookup(resolved)
            .ok_or_else(|| TxError::EngineNotFound(resolved.to_string()))?;

        match engine.new_session() {
            Ok(session) => {
                debug!(
                    "event=session_open module=registry status=ok engine={} driver={}",
                    resolved,
                    engine.driver()
                );
                Ok(session)
            }
            Err(err) => {
                error!(
                    "event=session_open module=registry status=error engine={} driver={} error={}",
                    resolved,
                    engine.driver(),
                    err
                );
                Err(TxError::Store(err))
            }
        }
    }
}

impl Debug for EngineRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.names())
            .finish()
    }
}

/// Collects engines and validates them into an `EngineRegistry`.
#[derive(Default)]
pub struct EngineRegistryBuilder {
    entries: Vec<(String, Arc<dyn EngineHandle>)>,
}

impl EngineRegistryBuilder {
    pub fn engine(self, name: impl Into<String>, engine: impl EngineHandle + 'static) -> Self {
        self.shared_engine(name, Arc::new(engine))
    }

    pub fn shared_engine(mut self, name: impl Into<String>, engine: Arc<dyn EngineHandle>) -> Self {
        self.entries.push((name.into(), engine));
        self
    }

    pub fn build(self) -> TxResult<EngineRegistry> {
        let mut engines = BTreeMap::new();
        for (name, engine) in self.entries {
            let name = name.trim().to_string();
            if !is_valid_engine_name(&name) {
                return Err(TxError::InvalidEngineName(name));
            }
            if engines.contains_key(name.as_str()) {
                return Err(TxError::DuplicateEngineName(name));
            }
            engines.insert(name, engine);
        }

        let Some(default_engine) = engines.get(DEFAULT_ENGINE).cloned() else {
            error!("event=registry_build module=registry status=error error_code=default_engine_missing");
            return Err(TxError::EngineNotFound(DEFAULT_ENGINE.to_string()));
        };
        Ok(EngineRegistry {
            engines,
            default_engine,
        })
    }
}

pub(crate) fn resolve_engine_name(name: &str) -> &str {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        DEFAULT_ENGINE
    } else {
        trimmed
    }
}

fn is_valid_engine_name(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}
