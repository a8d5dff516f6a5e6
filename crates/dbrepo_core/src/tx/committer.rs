//! Unit-of-work entry points over one or many repositories.
//!
//! # Responsibility
//! - Derive fresh repositories from caller templates.
//! - Bind them to sessions and drive the hook pipeline in transactional or
//!   non-transactional mode.
//!
//! # Invariants
//! - Template repositories are only read.
//! - In transactional mode every derived repository shares one binding.
//! - In non-transactional mode each derived repository has its own session,
//!   and store begin/commit are never called.

use super::hooks::Hooks;
use crate::error::{TxError, TxResult};
use crate::registry::DEFAULT_ENGINE;
use crate::repo::{CleanupGuard, RepoSet};
use log::debug;

/// Entry points for running hooks against repositories.
pub trait TransactionCommitter {
    /// Runs `hooks` in one transaction on the default engine.
    fn transaction<S: RepoSet>(&self, hooks: Hooks<'_, S>, repos: &S) -> TxResult<()> {
        self.transaction_using(hooks, DEFAULT_ENGINE, repos)
    }

    fn transaction_using<S: RepoSet>(
        &self,
        hooks: Hooks<'_, S>,
        engine_name: &str,
        repos: &S,
    ) -> TxResult<()>;

    /// Runs `hooks` without a store transaction on the default engine.
    fn no_transaction<S: RepoSet>(&self, hooks: Hooks<'_, S>, repos: &S) -> TxResult<()> {
        self.no_transaction_using(hooks, DEFAULT_ENGINE, repos)
    }

    fn no_transaction_using<S: RepoSet>(
        &self,
        hooks: Hooks<'_, S>,
        engine_name: &str,
        repos: &S,
    ) -> TxResult<()>;
}

/// Committer backed by the engines in each repository's context.
#[derive(Debug, Default, Clone, Copy)]
pub struct DbTxCommitter;

impl DbTxCommitter {
    pub fn new() -> Self {
        Self
    }
}

impl TransactionCommitter for DbTxCommitter {
    fn transaction_using<S: RepoSet>(
        &self,
        hooks: Hooks<'_, S>,
        engine_name: &str,
        repos: &S,
    ) -> TxResult<()> {
        ensure_inputs(&hooks, repos)?;
        let mut derived = repos.derive_all()?;

        let handle = {
            let mut contexts = derived.contexts_mut()?;
            let (first, rest) = contexts
                .split_first_mut()
                .ok_or(TxError::NoRepoSupplied)?;
            let handle = first.begin_transaction(engine_name)?.clone();
            let guard = CleanupGuard::new(vec![handle.clone()]);
            for ctx in rest {
                ctx.join(&handle)?;
            }
            guard.release();
            handle
        };
        debug!(
            "event=committer_bind module=tx status=ok mode=tx repos={} tx_id={}",
            derived.len(),
            handle.tx_id()
        );

        handle.commit_transaction(hooks, &mut derived)
    }

    fn no_transaction_using<S: RepoSet>(
        &self,
        hooks: Hooks<'_, S>,
        engine_name: &str,
        repos: &S,
    ) -> TxResult<()> {
        ensure_inputs(&hooks, repos)?;
        let mut derived = repos.derive_all()?;

        let sessions = {
            let mut guard = CleanupGuard::new(Vec::new());
            for ctx in derived.contexts_mut()? {
                let handle = ctx.begin_no_transaction(engine_name)?.clone();
                guard.push(handle);
            }
            guard.release()
        };
        let primary = sessions.first().cloned().ok_or(TxError::NoRepoSupplied)?;
        debug!(
            "event=committer_bind module=tx status=ok mode=no_tx repos={} tx_id={}",
            sessions.len(),
            primary.tx_id()
        );

        primary.commit_no_transaction(hooks, sessions, &mut derived)
    }
}

fn ensure_inputs<S: RepoSet>(hooks: &Hooks<'_, S>, repos: &S) -> TxResult<()> {
    if repos.is_empty() {
        return Err(TxError::NoRepoSupplied);
    }
    if hooks.is_empty() {
        return Err(TxError::NoLogicSupplied);
    }
    Ok(())
}
