//! Context lookup and repository derivation.
//!
//! A repository exposes its `TxContext` through [`Composable`], usually
//! generated with [`compose_tx_context!`](crate::compose_tx_context). Nested
//! repositories are probed depth-first in the order their fields are listed.

use super::context::TxContext;
use crate::error::{BoxError, TxError, TxResult};
use log::debug;
use std::any::type_name;

/// Access to the transaction context embedded in a value.
pub trait Composable {
    fn tx_context(&self) -> Option<&TxContext>;

    fn tx_context_mut(&mut self) -> Option<&mut TxContext>;
}

impl Composable for TxContext {
    fn tx_context(&self) -> Option<&TxContext> {
        Some(self)
    }

    fn tx_context_mut(&mut self) -> Option<&mut TxContext> {
        Some(self)
    }
}

impl<T: Composable> Composable for Option<T> {
    fn tx_context(&self) -> Option<&TxContext> {
        self.as_ref().and_then(Composable::tx_context)
    }

    fn tx_context_mut(&mut self) -> Option<&mut TxContext> {
        self.as_mut().and_then(Composable::tx_context_mut)
    }
}

impl<T: Composable + ?Sized> Composable for Box<T> {
    fn tx_context(&self) -> Option<&TxContext> {
        (**self).tx_context()
    }

    fn tx_context_mut(&mut self) -> Option<&mut TxContext> {
        (**self).tx_context_mut()
    }
}

/// Implements [`Composable`] for a struct.
///
/// `compose_tx_context!(UserRepo => ctx)` probes the listed fields in
/// order and returns the first context found. `compose_tx_context!(Plain)`
/// declares a type with no context.
#[macro_export]
macro_rules! compose_tx_context {
    ($ty:ty => $($field:ident),+ $(,)?) => {
        impl $crate::repo::Composable for $ty {
            fn tx_context(&self) -> ::core::option::Option<&$crate::repo::TxContext> {
                $(
                    if let ::core::option::Option::Some(ctx) =
                        $crate::repo::Composable::tx_context(&self.$field)
                    {
                        return ::core::option::Option::Some(ctx);
                    }
                )+
                ::core::option::Option::None
            }

            fn tx_context_mut(&mut self) -> ::core::option::Option<&mut $crate::repo::TxContext> {
                $(
                    if $crate::repo::Composable::tx_context(&self.$field).is_some() {
                        return $crate::repo::Composable::tx_context_mut(&mut self.$field);
                    }
                )+
                ::core::option::Option::None
            }
        }
    };
    ($ty:ty) => {
        impl $crate::repo::Composable for $ty {
            fn tx_context(&self) -> ::core::option::Option<&$crate::repo::TxContext> {
                ::core::option::Option::None
            }

            fn tx_context_mut(&mut self) -> ::core::option::Option<&mut $crate::repo::TxContext> {
                ::core::option::Option::None
            }
        }
    };
}

/// A value the committer can derive and bind.
///
/// Override `derive` to control construction entirely, or `inherit` to copy
/// state from the original onto a `Default` instance. The context of the
/// derived value is replaced with a fresh idle one either way.
pub trait Repository: Composable + Default {
    fn derive(&self) -> Result<Self, BoxError> {
        let mut fresh = Self::default();
        fresh.inherit(self)?;
        Ok(fresh)
    }

    fn inherit(&mut self, _original: &Self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl Repository for TxContext {}

/// Finds the context embedded in `repo`.
pub fn locate<R: Composable + ?Sized>(repo: &R) -> TxResult<&TxContext> {
    repo.tx_context().ok_or(TxError::StructureNotComposable {
        type_name: type_name::<R>(),
    })
}

pub fn locate_mut<R: Composable + ?Sized>(repo: &mut R) -> TxResult<&mut TxContext> {
    repo.tx_context_mut().ok_or(TxError::StructureNotComposable {
        type_name: type_name::<R>(),
    })
}

/// Builds a fresh instance of `original` with an idle context that shares
/// the original's engine registry.
///
/// # Errors
/// - `StructureNotComposable` when either instance has no context.
/// - `RepoConstructionFailed` when `derive`/`inherit` fails.
pub fn derive_fresh<R: Repository>(original: &R) -> TxResult<R> {
    let original_ctx = locate(original)?;
    let mut fresh = original
        .derive()
        .map_err(|source| TxError::RepoConstructionFailed {
            type_name: type_name::<R>(),
            source,
        })?;
    *locate_mut(&mut fresh)? = original_ctx.detached();
    debug!(
        "event=repo_derive module=repo status=ok type={}",
        type_name::<R>()
    );
    Ok(fresh)
}

/// Fixed group of repositories handed to a committer.
///
/// Implemented for `()`, tuples of up to six repositories and `Vec<R>`.
pub trait RepoSet: Sized {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Derives every member; see [`derive_fresh`].
    fn derive_all(&self) -> TxResult<Self>;

    /// Contexts of every member, in member order.
    fn contexts_mut(&mut self) -> TxResult<Vec<&mut TxContext>>;
}

impl RepoSet for () {
    fn len(&self) -> usize {
        0
    }

    fn derive_all(&self) -> TxResult<Self> {
        Ok(())
    }

    fn contexts_mut(&mut self) -> TxResult<Vec<&mut TxContext>> {
        Ok(Vec::new())
    }
}

impl<R: Repository> RepoSet for Vec<R> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn derive_all(&self) -> TxResult<Self> {
        self.iter().map(derive_fresh).collect()
    }

    fn contexts_mut(&mut self) -> TxResult<Vec<&mut TxContext>> {
        self.iter_mut().map(locate_mut).collect()
    }
}

macro_rules! impl_repo_set_for_tuple {
    ($len:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: Repository),+> RepoSet for ($($name,)+) {
            fn len(&self) -> usize {
                $len
            }

            fn derive_all(&self) -> TxResult<Self> {
                Ok(($(derive_fresh(&self.$idx)?,)+))
            }

            fn contexts_mut(&mut self) -> TxResult<Vec<&mut TxContext>> {
                Ok(vec![$(locate_mut(&mut self.$idx)?),+])
            }
        }
    };
}

impl_repo_set_for_tuple!(1; A: 0);
impl_repo_set_for_tuple!(2; A: 0, B: 1);
impl_repo_set_for_tuple!(3; A: 0, B: 1, C: 2);
impl_repo_set_for_tuple!(4; A: 0, B: 1, C: 2, D: 3);
impl_repo_set_for_tuple!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
impl_repo_set_for_tuple!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
