//! Runtime error taxonomy and the native-layer error protocol.
//!
//! Native code reports failure through [`RunResult`]: `Ok` means the retval
//! slot is populated, `Err` means an exception is pending. The `?` operator
//! is the propagation rule; callers never touch the retval slot on `Err`.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter, EnumString, IntoStaticStr};

use crate::value::Value;

/// Result type for every operation that can raise a Python-level exception.
pub type RunResult<T> = Result<T, RunError>;

/// The built-in exception kinds.
///
/// The string form of each variant is its Python class name. Subclass
/// relations live in the type table (each kind registers a type with its
/// base); `is_subclass_of` here mirrors that hierarchy for errors that have
/// not been materialised on the heap yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumCount, EnumString, EnumIter, IntoStaticStr, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ExcKind {
    BaseException,
    SystemExit,
    Exception,
    SyntaxError,
    NameError,
    AttributeError,
    TypeError,
    ValueError,
    KeyError,
    IndexError,
    ZeroDivisionError,
    OverflowError,
    ImportError,
    OSError,
    RuntimeError,
    NotImplementedError,
    RecursionError,
    StopIteration,
    AssertionError,
}

impl ExcKind {
    /// The base kind in the exception hierarchy.
    #[must_use]
    pub fn base(self) -> Option<Self> {
        match self {
            Self::BaseException => None,
            Self::SystemExit | Self::Exception => Some(Self::BaseException),
            Self::NotImplementedError | Self::RecursionError => Some(Self::RuntimeError),
            _ => Some(Self::Exception),
        }
    }

    /// True if an exception of kind `self` would be caught by
    /// `except handler:`.
    #[must_use]
    pub fn is_subclass_of(self, handler: Self) -> bool {
        let mut kind = self;
        loop {
            if kind == handler {
                return true;
            }
            match kind.base() {
                Some(base) => kind = base,
                None => return false,
            }
        }
    }
}

/// A pending exception flowing out of native code.
#[derive(Debug)]
pub enum RunError {
    /// An exception raised from native code, not yet materialised on the
    /// heap. The interpreter allocates the exception object when unwinding
    /// begins.
    Raise(ExcKind, Option<String>),
    /// A raised exception that already exists as a heap value (a `raise`
    /// statement, or a re-raise during unwinding).
    Value(Value),
}

impl RunError {
    #[must_use]
    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::Raise(ExcKind::TypeError, Some(msg.into()))
    }

    #[must_use]
    pub fn value_error(msg: impl Into<String>) -> Self {
        Self::Raise(ExcKind::ValueError, Some(msg.into()))
    }

    #[must_use]
    pub fn name_error(name: &str) -> Self {
        Self::Raise(ExcKind::NameError, Some(format!("name '{name}' is not defined")))
    }

    #[must_use]
    pub fn attribute_error(type_name: impl fmt::Display, attr: &str) -> Self {
        Self::Raise(
            ExcKind::AttributeError,
            Some(format!("'{type_name}' object has no attribute '{attr}'")),
        )
    }

    #[must_use]
    pub fn index_error(msg: impl Into<String>) -> Self {
        Self::Raise(ExcKind::IndexError, Some(msg.into()))
    }

    #[must_use]
    pub fn key_error(repr: impl Into<String>) -> Self {
        Self::Raise(ExcKind::KeyError, Some(repr.into()))
    }

    #[must_use]
    pub fn zero_division(msg: &str) -> Self {
        Self::Raise(ExcKind::ZeroDivisionError, Some(msg.to_owned()))
    }

    #[must_use]
    pub fn overflow(msg: &str) -> Self {
        Self::Raise(ExcKind::OverflowError, Some(msg.to_owned()))
    }

    #[must_use]
    pub fn import_error(msg: impl Into<String>) -> Self {
        Self::Raise(ExcKind::ImportError, Some(msg.into()))
    }

    #[must_use]
    pub fn os_error(msg: impl Into<String>) -> Self {
        Self::Raise(ExcKind::OSError, Some(msg.into()))
    }

    #[must_use]
    pub fn runtime_error(msg: impl Into<String>) -> Self {
        Self::Raise(ExcKind::RuntimeError, Some(msg.into()))
    }

    #[must_use]
    pub fn stop_iteration() -> Self {
        Self::Raise(ExcKind::StopIteration, None)
    }

    #[must_use]
    pub fn recursion_error() -> Self {
        Self::Raise(ExcKind::RecursionError, Some("maximum recursion depth exceeded".to_owned()))
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raise(kind, Some(msg)) => write!(f, "{kind}: {msg}"),
            Self::Raise(kind, None) => write!(f, "{kind}"),
            Self::Value(_) => write!(f, "<raised exception object>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subclass_hierarchy() {
        assert!(ExcKind::RecursionError.is_subclass_of(ExcKind::RuntimeError));
        assert!(ExcKind::RecursionError.is_subclass_of(ExcKind::Exception));
        assert!(ExcKind::KeyError.is_subclass_of(ExcKind::BaseException));
        assert!(!ExcKind::KeyError.is_subclass_of(ExcKind::IndexError));
        assert!(!ExcKind::SystemExit.is_subclass_of(ExcKind::Exception));
        assert!(ExcKind::SystemExit.is_subclass_of(ExcKind::BaseException));
    }

    #[test]
    fn test_kind_names_match_python() {
        assert_eq!(ExcKind::ZeroDivisionError.to_string(), "ZeroDivisionError");
        assert_eq!("StopIteration".parse::<ExcKind>().unwrap(), ExcKind::StopIteration);
    }
}
