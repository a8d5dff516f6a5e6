//! Dynamic callback invocation.
//!
//! # Responsibility
//! - Call a callback whose parameter and result types are only known at
//!   runtime, against a runtime-typed argument list.
//! - Enforce one result convention: the last result, if any, is an error.
//!
//! # Invariants
//! - Validation runs in a fixed order: callable, signature, arity, argument
//!   types. The callback body never runs when validation fails.
//! - A nil argument is only accepted by nullable parameter shapes.

pub mod args;
pub mod func;

pub use args::{AnyArg, Arg, ArgType, TypeShape, TypeSpec, Variadic};
pub use func::{CallOutput, DynFn, Fixed, IntoDynFn, IntoResults, Signature, WithRest};

use std::any::Any;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Validation failures reported before a callback runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// Candidate is absent or not a `DynFn`.
    NotCallable { found: &'static str },
    /// Non-empty result list that does not end with an error.
    BadSignature { last_result: &'static str },
    ArityMismatch {
        got: usize,
        want: usize,
        variadic: bool,
    },
    ArgumentTypeMismatch {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
}

impl Display for InvokeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotCallable { found } => write!(f, "value is not callable: {found}"),
            Self::BadSignature { last_result } => write!(
                f,
                "last result must be an error, found `{last_result}`"
            ),
            Self::ArityMismatch {
                got,
                want,
                variadic: true,
            } => write!(f, "expected at least {want} arguments, got {got}"),
            Self::ArityMismatch { got, want, .. } => {
                write!(f, "expected {want} arguments, got {got}")
            }
            Self::ArgumentTypeMismatch {
                index,
                expected,
                found,
            } => write!(
                f,
                "argument {index} is `{found}`, not assignable to `{expected}`"
            ),
        }
    }
}

impl Error for InvokeError {}

/// Calls `candidate` with `args`.
///
/// `candidate` is usually a boxed [`DynFn`] stored as `dyn Any`; anything
/// else is `NotCallable`.
pub fn call(candidate: Option<&dyn Any>, args: Vec<Arg>) -> Result<CallOutput, InvokeError> {
    let Some(candidate) = candidate else {
        return Err(InvokeError::NotCallable { found: "nil" });
    };
    let Some(func) = candidate.downcast_ref::<DynFn>() else {
        return Err(InvokeError::NotCallable {
            found: "non-function value",
        });
    };
    func.call(args)
}
