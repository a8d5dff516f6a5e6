//! Runtime-typed call arguments.
//!
//! # Invariants
//! - `Arg::Nil` is only assignable to types whose shape can hold an absent
//!   value (optional, container, polymorphic, error).
//! - `ArgType::accepts(arg)` implies `ArgType::from_arg(arg)` succeeds.

use crate::error::BoxError;
use crate::store::{Value, WriteBatch};
use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

/// One dynamically typed argument or result.
pub enum Arg {
    Nil,
    Value {
        value: Box<dyn Any + Send>,
        type_name: &'static str,
    },
}

impl Arg {
    pub fn of<T: Any + Send>(value: T) -> Self {
        Self::Value {
            value: Box::new(value),
            type_name: type_name::<T>(),
        }
    }

    pub fn nil() -> Self {
        Self::Nil
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Value { type_name, .. } => *type_name,
        }
    }

    pub fn is<T: Any>(&self) -> bool {
        match self {
            Self::Nil => false,
            Self::Value { value, .. } => value.is::<T>(),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Nil => None,
            Self::Value { value, .. } => value.downcast_ref::<T>(),
        }
    }

    /// Takes the value out, returning `self` unchanged on a type mismatch.
    pub fn downcast<T: Any>(self) -> Result<T, Arg> {
        match self {
            Self::Nil => Err(Self::Nil),
            Self::Value { value, type_name } => match value.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(value) => Err(Self::Value { value, type_name }),
            },
        }
    }
}

impl Debug for Arg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nil => f.write_str("Nil"),
            Self::Value { type_name, .. } => write!(f, "Value<{type_name}>"),
        }
    }
}

/// How a parameter or result type treats absent values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeShape {
    /// Plain value; never nil.
    Value,
    /// `Option<T>`; nil maps to `None`.
    Optional,
    /// `Vec<T>` / maps; nil maps to empty.
    Container,
    /// Accepts any argument.
    Any,
    /// Trailing error result.
    Error,
}

/// Runtime description of one declared parameter or result.
#[derive(Clone, Copy)]
pub struct TypeSpec {
    pub name: &'static str,
    pub shape: TypeShape,
    accepts: fn(&Arg) -> bool,
}

impl TypeSpec {
    pub fn of<T: ArgType>() -> Self {
        Self {
            name: type_name::<T>(),
            shape: T::SHAPE,
            accepts: T::accepts,
        }
    }

    pub fn error() -> Self {
        Self {
            name: "error",
            shape: TypeShape::Error,
            accepts: |arg| arg.is_nil() || arg.is::<BoxError>(),
        }
    }

    pub fn can_be_nil(&self) -> bool {
        !matches!(self.shape, TypeShape::Value)
    }

    pub fn accepts(&self, arg: &Arg) -> bool {
        (self.accepts)(arg)
    }
}

impl Debug for TypeSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeSpec")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .finish()
    }
}

/// A type that can cross the dynamic call boundary.
pub trait ArgType: Sized + Send + 'static {
    const SHAPE: TypeShape = TypeShape::Value;

    fn accepts(arg: &Arg) -> bool {
        match arg {
            Arg::Nil => Self::SHAPE != TypeShape::Value,
            value => value.is::<Self>(),
        }
    }

    fn from_arg(arg: Arg) -> Result<Self, Arg> {
        arg.downcast::<Self>()
    }

    fn into_arg(self) -> Arg {
        Arg::of(self)
    }
}

macro_rules! impl_value_arg_type {
    ($($ty:ty),+ $(,)?) => {
        $(impl ArgType for $ty {})+
    };
}

impl_value_arg_type!(bool, i32, i64, u32, u64, usize, f64, String, Value, WriteBatch);

impl<T: ArgType> ArgType for Option<T> {
    const SHAPE: TypeShape = TypeShape::Optional;

    fn accepts(arg: &Arg) -> bool {
        arg.is_nil() || arg.is::<Option<T>>() || T::accepts(arg)
    }

    fn from_arg(arg: Arg) -> Result<Self, Arg> {
        if arg.is_nil() {
            return Ok(None);
        }
        match arg.downcast::<Option<T>>() {
            Ok(value) => Ok(value),
            Err(arg) => T::from_arg(arg).map(Some),
        }
    }

    fn into_arg(self) -> Arg {
        match self {
            Some(value) => value.into_arg(),
            None => Arg::Nil,
        }
    }
}

impl<T: ArgType> ArgType for Vec<T> {
    const SHAPE: TypeShape = TypeShape::Container;

    fn from_arg(arg: Arg) -> Result<Self, Arg> {
        if arg.is_nil() {
            return Ok(Vec::new());
        }
        arg.downcast::<Self>()
    }
}

impl<T: ArgType> ArgType for BTreeMap<String, T> {
    const SHAPE: TypeShape = TypeShape::Container;

    fn from_arg(arg: Arg) -> Result<Self, Arg> {
        if arg.is_nil() {
            return Ok(BTreeMap::new());
        }
        arg.downcast::<Self>()
    }
}

/// Parameter that accepts any argument, including nil.
#[derive(Debug)]
pub struct AnyArg(pub Arg);

impl ArgType for AnyArg {
    const SHAPE: TypeShape = TypeShape::Any;

    fn accepts(_arg: &Arg) -> bool {
        true
    }

    fn from_arg(arg: Arg) -> Result<Self, Arg> {
        Ok(Self(arg))
    }

    fn into_arg(self) -> Arg {
        self.0
    }
}

/// Trailing parameter collecting every remaining argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Variadic<T>(pub Vec<T>);
