//! Parameter and return type descriptors.
//!
//! Rust has no runtime reflection, so every bound method carries explicit
//! descriptors for its parameters and returns. [`MethodArgs`] is implemented
//! for tuples of deserializable types and knows how to coerce positional
//! [`OpaqueValue`]s into itself. [`MethodReturn`] is implemented for the two
//! accepted return shapes:
//!
//! - `Result<T, E>`: a value plus an error-like slot. `Err` is a business
//!   error, reported with a SUCCESS code and the error text in the message.
//! - [`Fallible<E>`]: a single error-like slot. An error is an invocation
//!   failure.

use std::any::{type_name, TypeId};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::protocol::OpaqueValue;

/// Describes one parameter or return slot of a method.
#[derive(Clone, Copy)]
pub struct TypeDescriptor {
    name: &'static str,
    id: TypeId,
    error_like: bool,
}

impl TypeDescriptor {
    /// Descriptor for a plain value type.
    pub fn of<T: 'static>() -> Self {
        Self {
            name: type_name::<T>(),
            id: TypeId::of::<T>(),
            error_like: false,
        }
    }

    /// Descriptor for a type that can represent "no error" or a failure.
    pub fn error_like<T: 'static>() -> Self {
        Self {
            error_like: true,
            ..Self::of::<T>()
        }
    }

    /// Full Rust type name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this slot can carry a failure.
    pub fn is_error_like(&self) -> bool {
        self.error_like
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.error_like == other.error_like
    }
}

impl Eq for TypeDescriptor {}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error_like {
            write!(f, "{}!", self.name)
        } else {
            f.write_str(self.name)
        }
    }
}

/// Why wire arguments could not be turned into a method's parameters.
#[derive(Debug, Error)]
pub enum ArgError {
    #[error("expected {expected} args, got {got}")]
    Count { expected: usize, got: usize },

    #[error("arg {index}: {source}")]
    Decode {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Positional parameter list of a method.
pub trait MethodArgs: Sized + Send + 'static {
    /// Descriptors in declaration order.
    fn param_types() -> Vec<TypeDescriptor>;

    /// Coerce every wire argument. The first failure aborts the whole list.
    fn decode(args: &[OpaqueValue]) -> Result<Self, ArgError>;
}

macro_rules! impl_method_args {
    ($len:expr; $($idx:tt $name:ident),*) => {
        impl<$($name),*> MethodArgs for ($($name,)*)
        where
            $($name: DeserializeOwned + Send + 'static,)*
        {
            fn param_types() -> Vec<TypeDescriptor> {
                vec![$(TypeDescriptor::of::<$name>()),*]
            }

            #[allow(unused_variables)]
            fn decode(args: &[OpaqueValue]) -> Result<Self, ArgError> {
                if args.len() != $len {
                    return Err(ArgError::Count { expected: $len, got: args.len() });
                }
                Ok(($(
                    args[$idx]
                        .decode_into::<$name>()
                        .map_err(|source| ArgError::Decode { index: $idx, source })?,
                )*))
            }
        }
    };
}

impl_method_args!(0;);
impl_method_args!(1; 0 A);
impl_method_args!(2; 0 A, 1 B);
impl_method_args!(3; 0 A, 1 B, 2 C);
impl_method_args!(4; 0 A, 1 B, 2 C, 3 D);
impl_method_args!(5; 0 A, 1 B, 2 C, 3 D, 4 E);
impl_method_args!(6; 0 A, 1 B, 2 C, 3 D, 4 E, 5 F);

/// What a finished method produced, before it is turned into a response.
#[derive(Debug)]
pub enum CallOutcome {
    /// Result value, or the error from serializing it.
    Value(crate::error::Result<OpaqueValue>),
    /// Method returned its declared error value.
    BusinessError(String),
    /// Single error-like return carried an error.
    Failed(String),
}

/// Return shape of a method.
pub trait MethodReturn: Send + 'static {
    /// Descriptors for the one or two return slots.
    fn return_types() -> Vec<TypeDescriptor>;

    fn into_outcome(self) -> CallOutcome;
}

impl<T, E> MethodReturn for Result<T, E>
where
    T: Serialize + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn return_types() -> Vec<TypeDescriptor> {
        vec![TypeDescriptor::of::<T>(), TypeDescriptor::error_like::<E>()]
    }

    fn into_outcome(self) -> CallOutcome {
        match self {
            Ok(value) => CallOutcome::Value(OpaqueValue::encode(&value)),
            Err(e) => CallOutcome::BusinessError(e.to_string()),
        }
    }
}

/// Single error-like return: success with no value, or a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallible<E>(Option<E>);

impl<E> Fallible<E> {
    pub fn ok() -> Self {
        Self(None)
    }

    pub fn err(e: E) -> Self {
        Self(Some(e))
    }

    pub fn is_err(&self) -> bool {
        self.0.is_some()
    }
}

impl<E> From<Result<(), E>> for Fallible<E> {
    fn from(r: Result<(), E>) -> Self {
        Self(r.err())
    }
}

impl<E> MethodReturn for Fallible<E>
where
    E: fmt::Display + Send + 'static,
{
    fn return_types() -> Vec<TypeDescriptor> {
        vec![TypeDescriptor::error_like::<E>()]
    }

    fn into_outcome(self) -> CallOutcome {
        match self.0 {
            None => CallOutcome::Value(Ok(OpaqueValue::null())),
            Some(e) => CallOutcome::Failed(e.to_string()),
        }
    }
}
