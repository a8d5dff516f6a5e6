//! Type-erased callables with a runtime signature.

use super::args::{Arg, ArgType, TypeShape, TypeSpec, Variadic};
use super::InvokeError;
use crate::error::BoxError;
use std::fmt::{Debug, Formatter};
use std::iter::Enumerate;
use std::marker::PhantomData;
use std::vec::IntoIter;

type Body = Box<dyn Fn(Vec<Arg>) -> Result<Vec<Arg>, InvokeError> + Send + Sync>;

/// Declared parameters and results of a `DynFn`.
#[derive(Debug, Clone)]
pub struct Signature {
    pub params: Vec<TypeSpec>,
    pub variadic: Option<TypeSpec>,
    pub results: Vec<TypeSpec>,
}

impl Signature {
    pub fn is_variadic(&self) -> bool {
        self.variadic.is_some()
    }

    /// True when the result list is empty or ends with an error.
    pub fn returns_error_last(&self) -> bool {
        self.results
            .last()
            .map(|spec| spec.shape == TypeShape::Error)
            .unwrap_or(true)
    }

    fn declares_error(&self) -> bool {
        !self.results.is_empty()
    }

    /// Spec for the argument at `index`, or `None` past the fixed arity.
    pub fn param_at(&self, index: usize) -> Option<&TypeSpec> {
        self.params.get(index).or(self.variadic.as_ref())
    }
}

/// Leading values and trailing error returned by a call.
#[derive(Debug, Default)]
pub struct CallOutput {
    pub values: Vec<Arg>,
    pub error: Option<BoxError>,
}

impl CallOutput {
    fn split(mut results: Vec<Arg>, declares_error: bool) -> Self {
        if !declares_error {
            return Self {
                values: results,
                error: None,
            };
        }
        let error = match results.pop() {
            Some(Arg::Nil) | None => None,
            Some(arg) => match arg.downcast::<BoxError>() {
                Ok(err) => Some(err),
                Err(other) => {
                    let message = format!("callback returned {} as error", other.type_name());
                    Some(message.into())
                }
            },
        };
        Self {
            values: results,
            error,
        }
    }
}

/// A closure whose argument and result types are checked at call time.
pub struct DynFn {
    signature: Signature,
    body: Body,
}

impl DynFn {
    pub fn new<M>(func: impl IntoDynFn<M>) -> Self {
        func.into_dyn_fn()
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Validates `args` against the signature, then invokes the closure.
    ///
    /// # Errors
    /// `BadSignature`, `ArityMismatch` or `ArgumentTypeMismatch`, checked in
    /// that order. Errors returned by the closure itself are reported in
    /// `CallOutput::error`.
    pub fn call(&self, args: Vec<Arg>) -> Result<CallOutput, InvokeError> {
        let signature = &self.signature;
        if !signature.returns_error_last() {
            let last_result = signature
                .results
                .last()
                .map(|spec| spec.name)
                .unwrap_or("()");
            return Err(InvokeError::BadSignature { last_result });
        }

        let want = signature.params.len();
        let arity_ok = if signature.is_variadic() {
            args.len() >= want
        } else {
            args.len() == want
        };
        if !arity_ok {
            return Err(InvokeError::ArityMismatch {
                got: args.len(),
                want,
                variadic: signature.is_variadic(),
            });
        }

        for (index, arg) in args.iter().enumerate() {
            let Some(spec) = signature.param_at(index) else {
                continue;
            };
            let nil_rejected = arg.is_nil() && !spec.can_be_nil();
            if nil_rejected || !spec.accepts(arg) {
                return Err(InvokeError::ArgumentTypeMismatch {
                    index,
                    expected: spec.name,
                    found: arg.type_name(),
                });
            }
        }

        let results = (self.body)(args)?;
        Ok(CallOutput::split(results, signature.declares_error()))
    }
}

impl Debug for DynFn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynFn")
            .field("signature", &self.signature)
            .finish()
    }
}

/// Conversion of a typed closure into a `DynFn`.
///
/// `Marker` only disambiguates the blanket impls; it is inferred.
pub trait IntoDynFn<Marker>: Send + Sync + 'static {
    fn into_dyn_fn(self) -> DynFn;
}

/// Marker for closures with fixed parameters `P`.
pub struct Fixed<P>(PhantomData<P>);

/// Marker for closures with fixed parameters `P` and a `Variadic<T>` tail.
pub struct WithRest<P, T>(PhantomData<(P, T)>);

/// Result shapes a `DynFn` closure may return.
pub trait IntoResults: 'static {
    fn specs() -> Vec<TypeSpec>;

    fn into_results(self) -> Vec<Arg>;
}

impl IntoResults for () {
    fn specs() -> Vec<TypeSpec> {
        Vec::new()
    }

    fn into_results(self) -> Vec<Arg> {
        Vec::new()
    }
}

impl<T: ArgType> IntoResults for T {
    fn specs() -> Vec<TypeSpec> {
        vec![TypeSpec::of::<T>()]
    }

    fn into_results(self) -> Vec<Arg> {
        vec![self.into_arg()]
    }
}

impl IntoResults for Result<(), BoxError> {
    fn specs() -> Vec<TypeSpec> {
        vec![TypeSpec::error()]
    }

    fn into_results(self) -> Vec<Arg> {
        vec![error_arg(self.err())]
    }
}

impl<T: ArgType> IntoResults for Result<T, BoxError> {
    fn specs() -> Vec<TypeSpec> {
        vec![TypeSpec::of::<T>(), TypeSpec::error()]
    }

    fn into_results(self) -> Vec<Arg> {
        match self {
            Ok(value) => vec![value.into_arg(), Arg::Nil],
            Err(err) => vec![Arg::Nil, error_arg(Some(err))],
        }
    }
}

impl<A: ArgType, B: ArgType> IntoResults for Result<(A, B), BoxError> {
    fn specs() -> Vec<TypeSpec> {
        vec![TypeSpec::of::<A>(), TypeSpec::of::<B>(), TypeSpec::error()]
    }

    fn into_results(self) -> Vec<Arg> {
        match self {
            Ok((a, b)) => vec![a.into_arg(), b.into_arg(), Arg::Nil],
            Err(err) => vec![Arg::Nil, Arg::Nil, error_arg(Some(err))],
        }
    }
}

fn error_arg(err: Option<BoxError>) -> Arg {
    match err {
        Some(err) => Arg::of(err),
        None => Arg::Nil,
    }
}

fn next_param<T: ArgType>(args: &mut Enumerate<IntoIter<Arg>>) -> Result<T, InvokeError> {
    let Some((index, arg)) = args.next() else {
        return Err(InvokeError::ArityMismatch {
            got: 0,
            want: 1,
            variadic: false,
        });
    };
    convert(index, arg)
}

fn convert<T: ArgType>(index: usize, arg: Arg) -> Result<T, InvokeError> {
    T::from_arg(arg).map_err(|arg| InvokeError::ArgumentTypeMismatch {
        index,
        expected: std::any::type_name::<T>(),
        found: arg.type_name(),
    })
}

macro_rules! impl_into_dyn_fn {
    ($($param:ident),*) => {
        impl<Func, Out, $($param),*> IntoDynFn<Fixed<($($param,)*)>> for Func
        where
            Func: Fn($($param),*) -> Out + Send + Sync + 'static,
            Out: IntoResults,
            $($param: ArgType,)*
        {
            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn into_dyn_fn(self) -> DynFn {
                let signature = Signature {
                    params: vec![$(TypeSpec::of::<$param>()),*],
                    variadic: None,
                    results: Out::specs(),
                };
                DynFn {
                    signature,
                    body: Box::new(move |args: Vec<Arg>| {
                        let mut args = args.into_iter().enumerate();
                        $(let $param = next_param::<$param>(&mut args)?;)*
                        Ok((self)($($param),*).into_results())
                    }),
                }
            }
        }

        impl<Func, Out, Rest, $($param),*> IntoDynFn<WithRest<($($param,)*), Rest>> for Func
        where
            Func: Fn($($param,)* Variadic<Rest>) -> Out + Send + Sync + 'static,
            Out: IntoResults,
            Rest: ArgType,
            $($param: ArgType,)*
        {
            #[allow(non_snake_case, unused_mut)]
            fn into_dyn_fn(self) -> DynFn {
                let signature = Signature {
                    params: vec![$(TypeSpec::of::<$param>()),*],
                    variadic: Some(TypeSpec::of::<Rest>()),
                    results: Out::specs(),
                };
                DynFn {
                    signature,
                    body: Box::new(move |args: Vec<Arg>| {
                        let mut args = args.into_iter().enumerate();
                        $(let $param = next_param::<$param>(&mut args)?;)*
                        let rest = args
                            .map(|(index, arg)| convert::<Rest>(index, arg))
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok((self)($($param,)* Variadic(rest)).into_results())
                    }),
                }
            }
        }
    };
}

impl_into_dyn_fn!();
impl_into_dyn_fn!(P0);
impl_into_dyn_fn!(P0, P1);
impl_into_dyn_fn!(P0, P1, P2);
impl_into_dyn_fn!(P0, P1, P2, P3);
