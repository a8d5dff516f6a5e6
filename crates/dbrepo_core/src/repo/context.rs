//! Transaction context embedded in repositories.
//!
//! # Responsibility
//! - Carry the engine registry and the session binding of one repository.
//! - Drive the begin/commit/rollback/close lifecycle of a binding.
//!
//! # Invariants
//! - A fresh context is `Idle`; a derived context is never the original.
//! - Every context joined to one transaction shares a single `TxHandle`.
//! - A session opened by `begin_*` is closed exactly once, on every path.
//! - A transaction that begins either commits once or rolls back once.
//! - The session lock is held only while a `with_session` op runs; state
//!   accessors never take it.

use crate::error::{TxError, TxResult};
use crate::registry::{resolve_engine_name, EngineRegistry, DEFAULT_ENGINE};
use crate::store::{EngineHandle, Session, StoreResult};
use crate::tx::Hooks;
use log::{debug, error, info, warn};
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use uuid::Uuid;

/// Lifecycle state of a context binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Idle,
    TxBegun,
    NoTxBegun,
    Committed,
    RolledBack,
    Closed,
}

impl TxState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::TxBegun => "tx_begun",
            Self::NoTxBegun => "no_tx_begun",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Closed => "closed",
        }
    }
}

impl Display for TxState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of a transactional binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxOutcome {
    Committed,
    RolledBack,
}

/// Session binding shared by every context of one unit of work.
#[derive(Clone)]
pub struct TxHandle {
    binding: Arc<Binding>,
}

struct Binding {
    tx_id: Uuid,
    engine: String,
    transactional: bool,
    status: Mutex<Status>,
    session: Mutex<Option<Box<dyn Session>>>,
}

struct Status {
    state: TxState,
    outcome: Option<TxOutcome>,
}

impl TxHandle {
    fn open(engines: &EngineRegistry, engine_name: &str, transactional: bool) -> TxResult<Self> {
        let engine = resolve_engine_name(engine_name).to_string();
        let session = engines.open_session(&engine)?;
        let tx_id = Uuid::new_v4();
        let state = if transactional {
            TxState::TxBegun
        } else {
            TxState::NoTxBegun
        };
        debug!(
            "event=binding_open module=repo status=ok tx_id={} engine={} state={}",
            tx_id, engine, state
        );
        Ok(Self {
            binding: Arc::new(Binding {
                tx_id,
                engine,
                transactional,
                status: Mutex::new(Status {
                    state,
                    outcome: None,
                }),
                session: Mutex::new(Some(session)),
            }),
        })
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.binding
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> MutexGuard<'_, Option<Box<dyn Session>>> {
        self.binding
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: TxState, outcome: Option<TxOutcome>) {
        let mut status = self.status();
        status.state = state;
        if outcome.is_some() {
            status.outcome = outcome;
        }
    }

    /// Whether two handles are the same binding.
    pub fn ptr_eq(&self, other: &TxHandle) -> bool {
        Arc::ptr_eq(&self.binding, &other.binding)
    }

    pub fn tx_id(&self) -> Uuid {
        self.binding.tx_id
    }

    pub fn engine_name(&self) -> &str {
        &self.binding.engine
    }

    pub fn state(&self) -> TxState {
        self.status().state
    }

    /// `None` until a transactional binding commits or rolls back.
    pub fn outcome(&self) -> Option<TxOutcome> {
        self.status().outcome
    }

    pub fn is_transaction(&self) -> bool {
        self.binding.transactional
    }

    /// Runs `op` against the bound session.
    ///
    /// Only the session lock is held while `op` runs, so the accessors of
    /// this handle stay usable from inside it.
    ///
    /// # Errors
    /// - `SessionBusy` when called from inside another `with_session` on the
    ///   same binding.
    /// - `SessionUnavailable` after the binding has been closed.
    /// - `Store` for failures reported by `op`.
    pub fn with_session<T>(
        &self,
        op: impl FnOnce(&mut dyn Session) -> StoreResult<T>,
    ) -> TxResult<T> {
        let mut guard = match self.binding.session.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(TxError::SessionBusy),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let session = guard.as_mut().ok_or(TxError::SessionUnavailable)?;
        op(&mut **session).map_err(TxError::Store)
    }

    /// Runs the hook pipeline inside a store transaction.
    ///
    /// On return the session is closed. Any failure after the store
    /// transaction began rolls it back before close.
    pub(crate) fn commit_transaction<S>(
        &self,
        mut hooks: Hooks<'_, S>,
        repos: &mut S,
    ) -> TxResult<()> {
        let mut guard = CleanupGuard::new(vec![self.clone()]);
        if !self.binding.transactional || self.state() != TxState::TxBegun {
            return Err(TxError::NotInTransaction);
        }
        if self.session().is_none() {
            return Err(TxError::SessionUnavailable);
        }
        if hooks.is_empty() {
            return Err(TxError::NoLogicSupplied);
        }

        let tx_id = self.tx_id();
        if let Err(err) = self.with_session(|session| session.begin()) {
            error!(
                "event=tx_begin module=repo status=error tx_id={} error={}",
                tx_id, err
            );
            return Err(TxError::TxCannotBegin(Box::new(err)));
        }
        guard.arm_rollback();
        info!("event=tx_begin module=repo status=ok tx_id={}", tx_id);

        let outcome = hooks.run_logic(repos)?;
        if !outcome.writes.is_empty() {
            let report = self.with_session(|session| outcome.writes.apply(session))?;
            debug!(
                "event=tx_writes module=repo status=ok tx_id={} inserted={} updated={} deleted={}",
                tx_id, report.inserted, report.updated, report.deleted
            );
        }

        if let Err(err) = self.with_session(|session| session.commit()) {
            error!(
                "event=tx_commit module=repo status=error tx_id={} error={}",
                tx_id, err
            );
            return Err(TxError::TxCommitFailed(Box::new(err)));
        }
        guard.disarm_rollback();
        self.set_status(TxState::Committed, Some(TxOutcome::Committed));
        info!("event=tx_commit module=repo status=ok tx_id={}", tx_id);

        hooks.run_after_commit(outcome.values)
    }

    /// Runs the hook pipeline without a store transaction.
    ///
    /// Every handle in `sessions` is closed on return.
    pub(crate) fn commit_no_transaction<S>(
        &self,
        mut hooks: Hooks<'_, S>,
        sessions: Vec<TxHandle>,
        repos: &mut S,
    ) -> TxResult<()> {
        let _guard = CleanupGuard::new(sessions);
        if self.binding.transactional {
            return Err(TxError::AlreadyInTransaction);
        }
        if self.state() != TxState::NoTxBegun || self.session().is_none() {
            return Err(TxError::SessionUnavailable);
        }
        if hooks.is_empty() {
            return Err(TxError::NoLogicSupplied);
        }

        let tx_id = self.tx_id();
        info!("event=no_tx_begin module=repo status=ok tx_id={}", tx_id);
        let outcome = hooks.run_logic(repos)?;
        if !outcome.writes.is_empty() {
            self.with_session(|session| outcome.writes.apply(session))?;
        }
        hooks.run_after_commit(outcome.values)?;
        info!("event=no_tx_finish module=repo status=ok tx_id={}", tx_id);
        Ok(())
    }

    fn rollback(&self) {
        let tx_id = self.binding.tx_id;
        if let Some(session) = self.session().as_mut() {
            match session.rollback() {
                Ok(()) => info!("event=tx_rollback module=repo status=ok tx_id={}", tx_id),
                Err(err) => warn!(
                    "event=tx_rollback module=repo status=error tx_id={} error={}",
                    tx_id, err
                ),
            }
        }
        self.set_status(TxState::RolledBack, Some(TxOutcome::RolledBack));
    }

    fn close(&self) {
        let session = self.session().take();
        if let Some(mut session) = session {
            session.close();
            debug!(
                "event=session_close module=repo status=ok tx_id={} engine={}",
                self.binding.tx_id, self.binding.engine
            );
        }
        let mut status = self.status();
        if self.binding.transactional && status.outcome.is_none() {
            status.outcome = Some(TxOutcome::RolledBack);
        }
        status.state = TxState::Closed;
    }
}

impl Debug for TxHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("TxHandle")
            .field("tx_id", &self.binding.tx_id)
            .field("engine", &self.binding.engine)
            .field("transactional", &self.binding.transactional)
            .field("state", &status.state)
            .field("outcome", &status.outcome)
            .finish()
    }
}

/// Closes bindings on drop, rolling back first while armed.
pub(crate) struct CleanupGuard {
    handles: Vec<TxHandle>,
    rollback_armed: bool,
}

impl CleanupGuard {
    pub(crate) fn new(handles: Vec<TxHandle>) -> Self {
        Self {
            handles,
            rollback_armed: false,
        }
    }

    pub(crate) fn push(&mut self, handle: TxHandle) {
        self.handles.push(handle);
    }

    /// Hands the bindings to a new owner without closing them.
    pub(crate) fn release(mut self) -> Vec<TxHandle> {
        std::mem::take(&mut self.handles)
    }

    fn arm_rollback(&mut self) {
        self.rollback_armed = true;
    }

    fn disarm_rollback(&mut self) {
        self.rollback_armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        for handle in &self.handles {
            if self.rollback_armed {
                handle.rollback();
            }
            handle.close();
        }
    }
}

/// Per-repository transaction context.
///
/// Repositories embed one `TxContext` (directly or nested) and expose it
/// through `Composable`. The committer derives fresh repositories and binds
/// their contexts to one session; the originals are never mutated.
#[derive(Default)]
pub struct TxContext {
    engines: Option<Arc<EngineRegistry>>,
    handle: Option<TxHandle>,
}

impl TxContext {
    pub fn new(engines: Arc<EngineRegistry>) -> Self {
        Self {
            engines: Some(engines),
            handle: None,
        }
    }

    pub fn set_engines(&mut self, engines: Arc<EngineRegistry>) {
        self.engines = Some(engines);
    }

    pub fn engines(&self) -> Option<&Arc<EngineRegistry>> {
        self.engines.as_ref()
    }

    /// Returns the engine registered as `default`.
    pub fn default_engine(&self) -> Option<Arc<dyn EngineHandle>> {
        self.engines.as_ref().map(|engines| engines.default_engine())
    }

    /// True when bound to a transactional session.
    pub fn is_transaction(&self) -> bool {
        self.handle
            .as_ref()
            .map(TxHandle::is_transaction)
            .unwrap_or(false)
    }

    pub fn state(&self) -> TxState {
        self.handle
            .as_ref()
            .map(TxHandle::state)
            .unwrap_or(TxState::Idle)
    }

    pub fn handle(&self) -> Option<&TxHandle> {
        self.handle.as_ref()
    }

    /// Runs `op` against the bound session; see [`TxHandle::with_session`].
    pub fn with_session<T>(
        &self,
        op: impl FnOnce(&mut dyn Session) -> StoreResult<T>,
    ) -> TxResult<T> {
        self.handle
            .as_ref()
            .ok_or(TxError::SessionUnavailable)?
            .with_session(op)
    }

    /// Opens a caller-owned session on the default engine.
    pub fn new_session(&self) -> TxResult<Box<dyn Session>> {
        self.session_using(DEFAULT_ENGINE)
    }

    /// Opens a caller-owned session on `engine_name`.
    pub fn session_using(&self, engine_name: &str) -> TxResult<Box<dyn Session>> {
        self.registry(engine_name)?.open_session(engine_name)
    }

    /// Idle copy sharing this context's registry.
    pub(crate) fn detached(&self) -> TxContext {
        TxContext {
            engines: self.engines.clone(),
            handle: None,
        }
    }

    /// Opens a session on `engine_name` and marks the context transactional.
    pub(crate) fn begin_transaction(&mut self, engine_name: &str) -> TxResult<&TxHandle> {
        self.bind(engine_name, true)
    }

    /// Opens a session on `engine_name` without a store transaction.
    pub(crate) fn begin_no_transaction(&mut self, engine_name: &str) -> TxResult<&TxHandle> {
        self.bind(engine_name, false)
    }

    /// Shares an existing binding with this context.
    pub(crate) fn join(&mut self, handle: &TxHandle) -> TxResult<()> {
        if self.handle.is_some() {
            return Err(TxError::AlreadyInTransaction);
        }
        self.handle = Some(handle.clone());
        Ok(())
    }

    fn bind(&mut self, engine_name: &str, transactional: bool) -> TxResult<&TxHandle> {
        if self.handle.is_some() {
            return Err(TxError::AlreadyInTransaction);
        }
        let handle = TxHandle::open(self.registry(engine_name)?, engine_name, transactional)?;
        Ok(self.handle.insert(handle))
    }

    fn registry(&self, engine_name: &str) -> TxResult<&EngineRegistry> {
        self.engines
            .as_deref()
            .ok_or_else(|| TxError::EngineNotFound(resolve_engine_name(engine_name).to_string()))
    }
}

impl Debug for TxContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxContext")
            .field("engines", &self.engines)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{TxContext, TxOutcome, TxState};
    use crate::error::TxError;
    use crate::registry::EngineRegistry;
    use crate::store::memory::MemoryEngine;
    use crate::store::InsertItem;
    use crate::tx::Hooks;
    use std::sync::Arc;

    // Test-only: lets `expect_err` format the `Ok(Box<dyn Session>)` case.
    impl std::fmt::Debug for dyn crate::store::Session {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("Session")
        }
    }

    fn context(engine: &MemoryEngine) -> TxContext {
        let registry = EngineRegistry::builder()
            .engine("default", engine.clone())
            .build()
            .expect("registry");
        TxContext::new(Arc::new(registry))
    }

    #[test]
    fn fresh_context_is_idle_without_session() {
        let engine = MemoryEngine::new();
        let ctx = context(&engine);
        assert_eq!(ctx.state(), TxState::Idle);
        assert!(!ctx.is_transaction());
        let err = ctx
            .with_session(|session| session.find("users", &Default::default()))
            .expect_err("idle context has no session");
        assert!(matches!(err, TxError::SessionUnavailable));
    }

    #[test]
    fn begin_is_only_allowed_from_idle() {
        let engine = MemoryEngine::new();
        let mut ctx = context(&engine);
        ctx.begin_transaction("").expect("begin");
        assert_eq!(ctx.state(), TxState::TxBegun);
        assert!(ctx.is_transaction());

        assert!(matches!(
            ctx.begin_transaction("default"),
            Err(TxError::AlreadyInTransaction)
        ));
        assert!(matches!(
            ctx.begin_no_transaction("default"),
            Err(TxError::AlreadyInTransaction)
        ));
    }

    #[test]
    fn caller_owned_sessions_do_not_bind_the_context() {
        let engine = MemoryEngine::new();
        let ctx = context(&engine);
        assert!(ctx.default_engine().is_some());

        let mut session = ctx.new_session().expect("default session");
        session
            .insert_multi(&[InsertItem::new("users").field("name", "ada")])
            .expect("autocommit insert");
        session.close();
        assert_eq!(ctx.state(), TxState::Idle);
        assert_eq!(engine.rows("users").len(), 1);

        let err = ctx.session_using("reports").expect_err("unknown engine");
        assert!(matches!(err, TxError::EngineNotFound(name) if name == "reports"));
    }

    #[test]
    fn begin_without_registry_reports_engine_not_found() {
        let mut ctx = TxContext::default();
        let err = ctx.begin_transaction("").expect_err("no registry");
        assert!(matches!(err, TxError::EngineNotFound(name) if name == "default"));
    }

    #[test]
    fn nested_session_use_is_reported_busy() {
        let engine = MemoryEngine::new();
        let mut ctx = context(&engine);
        ctx.begin_no_transaction("").expect("begin");
        let outer = ctx.with_session(|_| {
            let inner = ctx.with_session(|session| session.find("users", &Default::default()));
            assert!(matches!(inner, Err(TxError::SessionBusy)));
            Ok(())
        });
        assert!(outer.is_ok());
    }

    #[test]
    fn commit_on_non_transactional_binding_is_rejected() {
        let engine = MemoryEngine::new();
        let mut ctx = context(&engine);
        let handle = ctx.begin_no_transaction("").expect("begin").clone();
        let err = handle
            .commit_transaction(Hooks::from_logic(|_: &mut ()| Ok(())), &mut ())
            .expect_err("no-tx binding cannot commit");
        assert!(matches!(err, TxError::NotInTransaction));

        let stats = engine.stats();
        assert_eq!(stats.begins, 0);
        assert_eq!(stats.sessions_closed, stats.sessions_opened);
        assert_eq!(handle.state(), TxState::Closed);
    }

    #[test]
    fn accessors_stay_usable_inside_a_session_op() {
        let engine = MemoryEngine::new();
        let mut ctx = context(&engine);
        let handle = ctx.begin_transaction("").expect("begin").clone();

        let seen = ctx
            .with_session(|_| {
                let rendered = format!("{ctx:?} {handle:?}");
                Ok((
                    ctx.is_transaction(),
                    ctx.state(),
                    handle.tx_id(),
                    handle.engine_name().to_string(),
                    handle.outcome(),
                    rendered.contains("TxBegun"),
                ))
            })
            .expect("op runs");
        assert_eq!(
            seen,
            (
                true,
                TxState::TxBegun,
                handle.tx_id(),
                "default".to_string(),
                None,
                true
            )
        );
    }

    #[test]
    fn empty_hooks_close_session_without_begin() {
        let engine = MemoryEngine::new();
        let mut ctx = context(&engine);
        let handle = ctx.begin_transaction("").expect("begin").clone();
        let err = handle
            .commit_transaction(Hooks::<()>::new(), &mut ())
            .expect_err("no logic");
        assert!(matches!(err, TxError::NoLogicSupplied));

        let stats = engine.stats();
        assert_eq!(stats.begins, 0);
        assert_eq!(stats.sessions_closed, stats.sessions_opened);
        assert_eq!(ctx.state(), TxState::Closed);
        assert_eq!(handle.outcome(), Some(TxOutcome::RolledBack));
    }

    #[test]
    fn committed_binding_is_closed_and_fails_fast() {
        let engine = MemoryEngine::new();
        let mut ctx = context(&engine);
        let handle = ctx.begin_transaction("").expect("begin").clone();
        handle
            .commit_transaction(
                Hooks::from_logic(|_: &mut ()| {
                    handle.with_session(|session| {
                        session.insert_multi(&[InsertItem::new("users").field("name", "ada")])
                    })?;
                    Ok(())
                }),
                &mut (),
            )
            .expect("commit");

        assert_eq!(handle.outcome(), Some(TxOutcome::Committed));
        assert_eq!(ctx.state(), TxState::Closed);
        assert_eq!(engine.rows("users").len(), 1);
        assert!(matches!(
            ctx.with_session(|session| session.begin()),
            Err(TxError::SessionUnavailable)
        ));
    }
}
