//! Repository-facing transaction plumbing.
//!
//! # Responsibility
//! - Give every repository an embedded `TxContext`.
//! - Locate and derive repositories so a committer can bind fresh copies
//!   to one shared session.
//!
//! # Invariants
//! - Original repositories passed to a committer are never mutated.
//! - Context lookup is depth-first in declaration order; the first context
//!   found wins.

pub mod context;
pub mod locator;

pub(crate) use context::CleanupGuard;
pub use context::{TxContext, TxHandle, TxOutcome, TxState};
pub use locator::{derive_fresh, locate, locate_mut, Composable, RepoSet, Repository};
