//! Hook pipeline and transaction committer.

pub mod committer;
pub mod hooks;

pub use committer::{DbTxCommitter, TransactionCommitter};
pub use hooks::{Hooks, IntoOutcome, Outcome, Phase, Values};
