//! Transactional repository core.
//!
//! Repositories embed a [`TxContext`]; a [`TransactionCommitter`] derives
//! fresh copies of them, binds the copies to one store session and runs a
//! phased [`Hooks`] descriptor inside a transaction (or without one).

pub mod config;
pub mod error;
pub mod invoke;
pub mod logging;
pub mod registry;
pub mod repo;
pub mod store;
pub mod tx;

pub use config::{ConfigError, EngineConfig, LoggingConfig, StoreConfig};
pub use error::{BoxError, TxError, TxResult};
pub use invoke::{call, AnyArg, Arg, CallOutput, DynFn, InvokeError, Variadic};
pub use logging::{default_log_level, init_logging, init_logging_from_config, logging_status};
pub use registry::{EngineRegistry, DEFAULT_ENGINE};
pub use repo::{Composable, RepoSet, Repository, TxContext, TxHandle, TxOutcome, TxState};
pub use store::memory::MemoryEngine;
pub use store::sqlite::SqliteEngine;
pub use store::{
    fields, DeleteItem, EngineHandle, Fields, InsertItem, Session, StoreError, UpdateItem, Value,
    WriteBatch,
};
pub use tx::{DbTxCommitter, Hooks, Outcome, Phase, TransactionCommitter, Values};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
