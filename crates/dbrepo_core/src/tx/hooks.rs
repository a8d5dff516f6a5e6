//! Phased callback descriptor.
//!
//! # Responsibility
//! - Hold the optional phases of one unit of work.
//! - Sequence `before_logic -> logic -> after_logic`, then `after_commit`
//!   once the caller has committed.
//!
//! # Invariants
//! - Each phase runs at most once.
//! - `on_error` observes `logic`/`after_logic` failures; it never replaces
//!   or suppresses the returned error.

use crate::error::{BoxError, TxError, TxResult};
use crate::invoke::{self, Arg, ArgType, DynFn, IntoDynFn};
use crate::store::WriteBatch;
use log::{debug, warn};
use std::any::Any;
use std::fmt::{Display, Formatter};

/// Pipeline phase names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    BeforeLogic,
    Logic,
    AfterLogic,
    OnError,
    AfterCommit,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeLogic => "before_logic",
            Self::Logic => "logic",
            Self::AfterLogic => "after_logic",
            Self::OnError => "on_error",
            Self::AfterCommit => "after_commit",
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values handed from the logic phases to `after_commit`.
#[derive(Debug, Default)]
pub struct Values(Vec<Arg>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a typed value; `None` options become nil.
    pub fn push(&mut self, value: impl ArgType) -> &mut Self {
        self.0.push(value.into_arg());
        self
    }

    pub fn push_arg(&mut self, arg: Arg) -> &mut Self {
        self.0.push(arg);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_args(self) -> Vec<Arg> {
        self.0
    }
}

impl From<Vec<Arg>> for Values {
    fn from(value: Vec<Arg>) -> Self {
        Self(value)
    }
}

/// What a logic phase produced.
#[derive(Debug, Default)]
pub struct Outcome {
    pub values: Values,
    pub writes: WriteBatch,
}

impl Outcome {
    fn merge(&mut self, later: Outcome) {
        self.values = later.values;
        self.writes.extend(later.writes);
    }
}

/// Return types accepted from `before_logic`, `logic` and `after_logic`.
pub trait IntoOutcome {
    fn into_outcome(self) -> Outcome;
}

impl IntoOutcome for () {
    fn into_outcome(self) -> Outcome {
        Outcome::default()
    }
}

impl IntoOutcome for Values {
    fn into_outcome(self) -> Outcome {
        Outcome {
            values: self,
            writes: WriteBatch::default(),
        }
    }
}

impl IntoOutcome for WriteBatch {
    fn into_outcome(self) -> Outcome {
        Outcome {
            values: Values::default(),
            writes: self,
        }
    }
}

impl IntoOutcome for Outcome {
    fn into_outcome(self) -> Outcome {
        self
    }
}

type PhaseFn<'h, S> = Box<dyn FnOnce(&mut S) -> Result<Outcome, BoxError> + 'h>;
type ErrorFn<'h> = Box<dyn FnOnce(&TxError) -> Result<(), BoxError> + 'h>;

/// Callback descriptor for one committer call over repositories `S`.
pub struct Hooks<'h, S> {
    before_logic: Option<PhaseFn<'h, S>>,
    logic: Option<PhaseFn<'h, S>>,
    after_logic: Option<PhaseFn<'h, S>>,
    on_error: Option<ErrorFn<'h>>,
    after_commit: Option<Box<dyn Any + Send>>,
}

impl<'h, S> Default for Hooks<'h, S> {
    fn default() -> Self {
        Self {
            before_logic: None,
            logic: None,
            after_logic: None,
            on_error: None,
            after_commit: None,
        }
    }
}

impl<'h, S> Hooks<'h, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor with only a `logic` phase.
    pub fn from_logic<O, F>(logic: F) -> Self
    where
        F: FnOnce(&mut S) -> Result<O, BoxError> + 'h,
        O: IntoOutcome,
    {
        Self::new().logic(logic)
    }

    pub fn before_logic<O, F>(mut self, phase: F) -> Self
    where
        F: FnOnce(&mut S) -> Result<O, BoxError> + 'h,
        O: IntoOutcome,
    {
        self.before_logic = Some(boxed_phase(phase));
        self
    }

    pub fn logic<O, F>(mut self, phase: F) -> Self
    where
        F: FnOnce(&mut S) -> Result<O, BoxError> + 'h,
        O: IntoOutcome,
    {
        self.logic = Some(boxed_phase(phase));
        self
    }

    pub fn after_logic<O, F>(mut self, phase: F) -> Self
    where
        F: FnOnce(&mut S) -> Result<O, BoxError> + 'h,
        O: IntoOutcome,
    {
        self.after_logic = Some(boxed_phase(phase));
        self
    }

    /// Observer for `logic`/`after_logic` failures.
    pub fn on_error<F>(mut self, observer: F) -> Self
    where
        F: FnOnce(&TxError) -> Result<(), BoxError> + 'h,
    {
        self.on_error = Some(Box::new(observer));
        self
    }

    /// Callback run after a successful commit with the logic phase values.
    pub fn after_commit<M>(self, callback: impl IntoDynFn<M>) -> Self {
        self.after_commit_value(Box::new(DynFn::new(callback)))
    }

    /// Like `after_commit`, for a value only checked when invoked.
    pub fn after_commit_value(mut self, callback: Box<dyn Any + Send>) -> Self {
        self.after_commit = Some(callback);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.phases().is_empty()
    }

    /// Phases present in this descriptor, in pipeline order.
    pub fn phases(&self) -> Vec<Phase> {
        [
            (Phase::BeforeLogic, self.before_logic.is_some()),
            (Phase::Logic, self.logic.is_some()),
            (Phase::AfterLogic, self.after_logic.is_some()),
            (Phase::OnError, self.on_error.is_some()),
            (Phase::AfterCommit, self.after_commit.is_some()),
        ]
        .into_iter()
        .filter_map(|(phase, present)| present.then_some(phase))
        .collect()
    }

    /// Runs the phases that precede a commit.
    pub(crate) fn run_logic(&mut self, repos: &mut S) -> TxResult<Outcome> {
        let mut outcome = Outcome::default();
        if let Some(phase) = self.before_logic.take() {
            outcome = phase(repos).map_err(|source| {
                warn!(
                    "event=hook_failed module=tx status=error phase={} error={}",
                    Phase::BeforeLogic,
                    source
                );
                TxError::hook(Phase::BeforeLogic, source)
            })?;
        }
        if let Some(phase) = self.logic.take() {
            match phase(repos) {
                Ok(produced) => outcome.merge(produced),
                Err(source) => return Err(self.observe(Phase::Logic, source)),
            }
        }
        if let Some(phase) = self.after_logic.take() {
            match phase(repos) {
                Ok(produced) => outcome.merge(produced),
                Err(source) => return Err(self.observe(Phase::AfterLogic, source)),
            }
        }
        Ok(outcome)
    }

    /// Invokes `after_commit`, if present, with `values`.
    pub(crate) fn run_after_commit(&mut self, values: Values) -> TxResult<()> {
        let Some(callback) = self.after_commit.take() else {
            return Ok(());
        };
        let candidate: &dyn Any = &*callback;
        let output = invoke::call(Some(candidate), values.into_args())?;
        match output.error {
            Some(source) => {
                warn!(
                    "event=hook_failed module=tx status=error phase={} error={}",
                    Phase::AfterCommit,
                    source
                );
                Err(TxError::hook(Phase::AfterCommit, source))
            }
            None => {
                debug!(
                    "event=after_commit module=tx status=ok values={}",
                    output.values.len()
                );
                Ok(())
            }
        }
    }

    fn observe(&mut self, phase: Phase, source: BoxError) -> TxError {
        warn!(
            "event=hook_failed module=tx status=error phase={} error={}",
            phase, source
        );
        let mut err = TxError::hook(phase, source);
        let Some(observer) = self.on_error.take() else {
            return err;
        };
        if let Err(failure) = observer(&err) {
            warn!(
                "event=hook_failed module=tx status=error phase={} error={}",
                Phase::OnError,
                failure
            );
            if let TxError::Hook {
                on_error_failure, ..
            } = &mut err
            {
                *on_error_failure = Some(failure);
            }
        }
        err
    }
}

fn boxed_phase<'h, S, O, F>(phase: F) -> PhaseFn<'h, S>
where
    F: FnOnce(&mut S) -> Result<O, BoxError> + 'h,
    O: IntoOutcome,
{
    Box::new(move |repos: &mut S| phase(repos).map(IntoOutcome::into_outcome))
}

#[cfg(test)]
mod tests {
    use super::{Hooks, Phase, Values};
    use crate::error::{BoxError, TxError};
    use crate::store::{InsertItem, WriteBatch};
    use std::cell::RefCell;

    #[test]
    fn phases_run_in_order_and_later_values_win() {
        let order = RefCell::new(Vec::new());
        let mut hooks = Hooks::<()>::new()
            .before_logic(|_| {
                order.borrow_mut().push(Phase::BeforeLogic);
                Ok(())
            })
            .logic(|_| {
                order.borrow_mut().push(Phase::Logic);
                let mut values = Values::new();
                values.push(1_i64);
                Ok(values)
            })
            .after_logic(|_| {
                order.borrow_mut().push(Phase::AfterLogic);
                let mut writes = WriteBatch::new();
                writes.append_insert(InsertItem::new("audit").field("event", "done"));
                Ok(writes)
            });

        let outcome = hooks.run_logic(&mut ()).expect("pipeline");
        assert_eq!(
            *order.borrow(),
            vec![Phase::BeforeLogic, Phase::Logic, Phase::AfterLogic]
        );
        assert!(outcome.values.is_empty());
        assert_eq!(outcome.writes.len(), 1);
    }

    #[test]
    fn on_error_observes_without_replacing_the_error() {
        let seen = RefCell::new(None);
        let mut hooks = Hooks::<()>::new()
            .logic(|_| -> Result<(), BoxError> { Err("logic broke".into()) })
            .on_error(|err| {
                *seen.borrow_mut() = err.phase();
                Err("observer broke".into())
            });

        let err = hooks.run_logic(&mut ()).expect_err("logic fails");
        assert_eq!(*seen.borrow(), Some(Phase::Logic));
        match err {
            TxError::Hook {
                phase,
                source,
                on_error_failure,
            } => {
                assert_eq!(phase, Phase::Logic);
                assert_eq!(source.to_string(), "logic broke");
                let failure = on_error_failure.expect("observer failure attached");
                assert_eq!(failure.to_string(), "observer broke");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn before_logic_failure_skips_on_error() {
        let observed = RefCell::new(false);
        let mut hooks = Hooks::<()>::new()
            .before_logic(|_| -> Result<(), BoxError> { Err("not ready".into()) })
            .on_error(|_| {
                *observed.borrow_mut() = true;
                Ok(())
            });
        let err = hooks.run_logic(&mut ()).expect_err("before fails");
        assert_eq!(err.phase(), Some(Phase::BeforeLogic));
        assert!(!*observed.borrow());
    }

    #[test]
    fn empty_descriptor_lists_no_phases() {
        let hooks = Hooks::<()>::new();
        assert!(hooks.is_empty());
        let hooks = hooks.after_commit(|| {});
        assert_eq!(hooks.phases(), vec![Phase::AfterCommit]);
    }
}
