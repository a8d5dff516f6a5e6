//! Crate-level error taxonomy.
//!
//! # Invariants
//! - Errors are returned to the immediate caller; nothing is swallowed.
//! - Store-level causes stay reachable through `source()`.
//! - `code()` values are stable across releases.

use crate::config::ConfigError;
use crate::invoke::InvokeError;
use crate::store::StoreError;
use crate::tx::Phase;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Error type returned by application callbacks and repository hooks.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

pub type TxResult<T> = Result<T, TxError>;

/// Errors from engine lookup, repository derivation and transaction lifecycle.
#[derive(Debug)]
pub enum TxError {
    /// Named engine is not registered (including a missing `default`).
    EngineNotFound(String),
    /// Engine name is blank or contains unsupported characters.
    InvalidEngineName(String),
    /// Engine name registered twice.
    DuplicateEngineName(String),
    /// Context already has a transaction or session in progress.
    AlreadyInTransaction,
    /// Transactional commit requested on a non-transactional context.
    NotInTransaction,
    /// No open session on the context.
    SessionUnavailable,
    /// Session binding is already in use by an enclosing call.
    SessionBusy,
    /// Committer called without repositories.
    NoRepoSupplied,
    /// Committer called with a descriptor holding no phases.
    NoLogicSupplied,
    /// Repository type does not compose a `TxContext`.
    StructureNotComposable { type_name: &'static str },
    /// Fresh repository instance could not be built.
    RepoConstructionFailed {
        type_name: &'static str,
        source: BoxError,
    },
    /// Transaction could not be started.
    TxCannotBegin(Box<TxError>),
    /// Store commit failed; the transaction was rolled back.
    TxCommitFailed(Box<TxError>),
    /// Store operation failed outside begin/commit.
    Store(StoreError),
    /// Dynamic callback validation failed.
    Invoke(InvokeError),
    /// A hook phase returned an error.
    Hook {
        phase: Phase,
        source: BoxError,
        /// Failure of the `OnError` observer, kept alongside the original error.
        on_error_failure: Option<BoxError>,
    },
    /// Engine configuration could not be loaded.
    Config(ConfigError),
}

impl TxError {
    pub(crate) fn hook(phase: Phase, source: BoxError) -> Self {
        Self::Hook {
            phase,
            source,
            on_error_failure: None,
        }
    }

    /// Stable numeric code for this error kind.
    pub fn code(&self) -> u32 {
        match self {
            Self::SessionUnavailable => 11001,
            Self::AlreadyInTransaction => 11002,
            Self::NotInTransaction => 11003,
            Self::TxCommitFailed(_) => 11005,
            Self::NoLogicSupplied => 11006,
            Self::TxCannotBegin(_) => 11007,
            Self::NoRepoSupplied => 11008,
            Self::StructureNotComposable { .. } => 11009,
            Self::RepoConstructionFailed { .. } => 11010,
            Self::EngineNotFound(_) => 11011,
            Self::InvalidEngineName(_) => 11012,
            Self::DuplicateEngineName(_) => 11013,
            Self::SessionBusy => 11014,
            Self::Store(_) => 11015,
            Self::Invoke(_) => 11016,
            Self::Hook { .. } => 11017,
            Self::Config(_) => 11018,
        }
    }

    /// Phase that failed, for hook errors.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Hook { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

impl Display for TxError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EngineNotFound(name) => write!(f, "engine not found: `{name}`"),
            Self::InvalidEngineName(name) => write!(f, "engine name is invalid: `{name}`"),
            Self::DuplicateEngineName(name) => write!(f, "engine already registered: `{name}`"),
            Self::AlreadyInTransaction => write!(f, "transaction already begun"),
            Self::NotInTransaction => write!(f, "non-transactional context cannot be committed"),
            Self::SessionUnavailable => write!(f, "db session is not open"),
            Self::SessionBusy => write!(f, "db session is already in use"),
            Self::NoRepoSupplied => write!(f, "at least one repository is required"),
            Self::NoLogicSupplied => write!(f, "no logic supplied"),
            Self::StructureNotComposable { type_name } => write!(
                f,
                "repository type `{type_name}` does not compose a transaction context"
            ),
            Self::RepoConstructionFailed { type_name, source } => {
                write!(f, "could not derive repository `{type_name}`: {source}")
            }
            Self::TxCannotBegin(err) => write!(f, "could not begin transaction: {err}"),
            Self::TxCommitFailed(err) => write!(f, "commit failed: {err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Invoke(err) => write!(f, "{err}"),
            Self::Hook {
                phase,
                source,
                on_error_failure,
            } => {
                write!(f, "{phase} failed: {source}")?;
                if let Some(observer) = on_error_failure {
                    write!(f, " (on_error also failed: {observer})")?;
                }
                Ok(())
            }
            Self::Config(err) => write!(f, "{err}"),
        }
    }
}

impl Error for TxError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::RepoConstructionFailed { source, .. } => Some(source.as_ref()),
            Self::TxCannotBegin(err) => Some(err.as_ref()),
            Self::TxCommitFailed(err) => Some(err.as_ref()),
            Self::Store(err) => Some(err),
            Self::Invoke(err) => Some(err),
            Self::Hook { source, .. } => Some(source.as_ref()),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for TxError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<InvokeError> for TxError {
    fn from(value: InvokeError) -> Self {
        Self::Invoke(value)
    }
}

impl From<ConfigError> for TxError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

#[cfg(test)]
mod tests {
    use super::TxError;
    use crate::store::StoreError;
    use crate::tx::Phase;
    use std::error::Error;

    #[test]
    fn hook_error_keeps_on_error_failure_visible() {
        let err = TxError::Hook {
            phase: Phase::Logic,
            source: "boom".into(),
            on_error_failure: Some("observer broke".into()),
        };
        let message = err.to_string();
        assert!(message.contains("logic failed: boom"));
        assert!(message.contains("observer broke"));
        assert_eq!(err.phase(), Some(Phase::Logic));
    }

    #[test]
    fn codes_are_stable_per_kind() {
        assert_eq!(TxError::SessionUnavailable.code(), 11001);
        assert_eq!(TxError::NoRepoSupplied.code(), 11008);
        assert_eq!(TxError::EngineNotFound("default".to_string()).code(), 11011);
        assert_eq!(TxError::SessionBusy.code(), 11014);
    }

    #[test]
    fn begin_failure_chains_to_store_cause() {
        let err = TxError::TxCannotBegin(Box::new(TxError::Store(StoreError::Injected("begin"))));
        assert_eq!(err.code(), 11007);
        let inner = err.source().expect("begin failure has a source");
        assert!(inner.to_string().contains("injected failure during begin"));
    }
}
