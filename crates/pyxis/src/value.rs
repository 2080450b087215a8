//! The uniform 16-byte value handle.
//!
//! A [`Value`] is either *inline* (the payload lives in the handle itself) or
//! *boxed* (the payload lives on the managed heap). Both shapes carry the
//! type id, so dispatch never has to touch the heap for the common case. The
//! type tag of a boxed value is a duplicate of the heap object's tag; the two
//! always agree.

use serde::{Deserialize, Serialize};

use crate::types::{self, TypeId};

/// Index of a heap slot. See [`crate::heap::Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeapId(u32);

impl HeapId {
    /// Builds a HeapId from a raw slot index.
    #[inline]
    #[must_use]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).expect("heap slot index exceeds u32"))
    }

    /// Returns the raw slot index.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An 8-byte inline payload, reinterpretable as the small scalar shapes.
///
/// Stored as raw bits so one field serves `int`, `float`, `bool`, `None`
/// and the 2-vector types. The active interpretation is decided by the
/// value's type tag, never by the payload itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scalar(u64);

impl Scalar {
    pub(crate) const ZERO: Self = Self(0);

    #[inline]
    #[must_use]
    pub fn from_int(v: i64) -> Self {
        Self(v.cast_unsigned())
    }

    #[inline]
    #[must_use]
    pub fn from_float(v: f64) -> Self {
        Self(v.to_bits())
    }

    #[inline]
    #[must_use]
    pub fn from_bool(v: bool) -> Self {
        Self(u64::from(v))
    }

    #[inline]
    #[must_use]
    pub fn from_vec2(x: f32, y: f32) -> Self {
        Self(u64::from(x.to_bits()) | (u64::from(y.to_bits()) << 32))
    }

    #[inline]
    #[must_use]
    pub fn from_vec2i(x: i32, y: i32) -> Self {
        Self(u64::from(x.cast_unsigned()) | (u64::from(y.cast_unsigned()) << 32))
    }

    #[inline]
    #[must_use]
    pub fn as_int(self) -> i64 {
        self.0.cast_signed()
    }

    #[inline]
    #[must_use]
    pub fn as_float(self) -> f64 {
        f64::from_bits(self.0)
    }

    #[inline]
    #[must_use]
    pub fn as_bool(self) -> bool {
        self.0 != 0
    }

    #[inline]
    #[must_use]
    pub fn as_vec2(self) -> (f32, f32) {
        let x = f32::from_bits((self.0 & 0xFFFF_FFFF) as u32);
        let y = f32::from_bits((self.0 >> 32) as u32);
        (x, y)
    }

    #[inline]
    #[must_use]
    pub fn as_vec2i(self) -> (i32, i32) {
        let x = ((self.0 & 0xFFFF_FFFF) as u32).cast_signed();
        let y = ((self.0 >> 32) as u32).cast_signed();
        (x, y)
    }
}

/// The uniform value handle.
///
/// `Copy` by design: lifetimes are owned entirely by the tracing collector,
/// so handles can be duplicated freely. Reachability, not handle count,
/// decides when a heap object dies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// A small scalar stored directly in the handle.
    Inline(TypeId, Scalar),
    /// A handle to an object on the managed heap. The type tag duplicates
    /// the heap object's tag for fast dispatch.
    Boxed(TypeId, HeapId),
}

const _: () = assert!(size_of::<Value>() == 16, "Value must stay a 16-byte handle");

impl Value {
    /// The empty-slot sentinel. Never observable from user code; locals that
    /// were never assigned hold NIL, which is distinct from `None`.
    pub const NIL: Self = Self::Inline(types::TP_NIL, Scalar::ZERO);

    /// The `None` singleton.
    pub const NONE: Self = Self::Inline(types::TP_NONE, Scalar::ZERO);

    /// The `NotImplemented` singleton, returned by binary dunders to defer
    /// to the reflected operand.
    pub const NOT_IMPLEMENTED: Self = Self::Inline(types::TP_NOT_IMPLEMENTED, Scalar::ZERO);

    #[inline]
    #[must_use]
    pub fn new_int(v: i64) -> Self {
        Self::Inline(types::TP_INT, Scalar::from_int(v))
    }

    #[inline]
    #[must_use]
    pub fn new_float(v: f64) -> Self {
        Self::Inline(types::TP_FLOAT, Scalar::from_float(v))
    }

    #[inline]
    #[must_use]
    pub fn new_bool(v: bool) -> Self {
        Self::Inline(types::TP_BOOL, Scalar::from_bool(v))
    }

    #[inline]
    #[must_use]
    pub fn new_vec2(x: f32, y: f32) -> Self {
        Self::Inline(types::TP_VEC2, Scalar::from_vec2(x, y))
    }

    #[inline]
    #[must_use]
    pub fn new_vec2i(x: i32, y: i32) -> Self {
        Self::Inline(types::TP_VEC2I, Scalar::from_vec2i(x, y))
    }

    /// The type tag. Always valid, and equal to the heap object's tag when
    /// boxed.
    #[inline]
    #[must_use]
    pub fn type_of(self) -> TypeId {
        match self {
            Self::Inline(t, _) | Self::Boxed(t, _) => t,
        }
    }

    /// True for boxed values.
    #[inline]
    #[must_use]
    pub fn is_ptr(self) -> bool {
        matches!(self, Self::Boxed(..))
    }

    /// The heap handle of a boxed value.
    #[inline]
    #[must_use]
    pub fn as_obj(self) -> Option<HeapId> {
        match self {
            Self::Boxed(_, id) => Some(id),
            Self::Inline(..) => None,
        }
    }

    /// True for the NIL empty-slot sentinel.
    #[inline]
    #[must_use]
    pub fn is_nil(self) -> bool {
        self.type_of() == types::TP_NIL
    }

    /// True for the `None` singleton.
    #[inline]
    #[must_use]
    pub fn is_none(self) -> bool {
        self.type_of() == types::TP_NONE
    }

    /// True for the `NotImplemented` singleton.
    #[inline]
    #[must_use]
    pub fn is_not_implemented(self) -> bool {
        self.type_of() == types::TP_NOT_IMPLEMENTED
    }

    /// Inline `int` payload; `None` if the value is not an inline int.
    #[inline]
    #[must_use]
    pub fn as_int(self) -> Option<i64> {
        match self {
            Self::Inline(t, s) if t == types::TP_INT => Some(s.as_int()),
            _ => None,
        }
    }

    /// Inline `float` payload; `None` if the value is not an inline float.
    #[inline]
    #[must_use]
    pub fn as_float(self) -> Option<f64> {
        match self {
            Self::Inline(t, s) if t == types::TP_FLOAT => Some(s.as_float()),
            _ => None,
        }
    }

    /// Inline `bool` payload; `None` if the value is not an inline bool.
    #[inline]
    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Inline(t, s) if t == types::TP_BOOL => Some(s.as_bool()),
            _ => None,
        }
    }

    /// Numeric payload widened to `f64` (`int`, `float` or `bool`).
    #[inline]
    #[must_use]
    pub fn as_number(self) -> Option<f64> {
        match self {
            Self::Inline(t, s) if t == types::TP_FLOAT => Some(s.as_float()),
            Self::Inline(t, s) if t == types::TP_INT => Some(s.as_int() as f64),
            Self::Inline(t, s) if t == types::TP_BOOL => Some(f64::from(u8::from(s.as_bool()))),
            _ => None,
        }
    }

    /// Integral payload (`int` or `bool` promoted to int).
    #[inline]
    #[must_use]
    pub fn as_index(self) -> Option<i64> {
        match self {
            Self::Inline(t, s) if t == types::TP_INT => Some(s.as_int()),
            Self::Inline(t, s) if t == types::TP_BOOL => Some(i64::from(s.as_bool())),
            _ => None,
        }
    }

    /// Raw inline payload. `None` for boxed values.
    #[inline]
    #[must_use]
    pub fn payload(self) -> Option<Scalar> {
        match self {
            Self::Inline(_, s) => Some(s),
            Self::Boxed(..) => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::new_bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::new_int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::new_float(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;

    #[test]
    fn test_value_is_16_bytes() {
        assert_eq!(size_of::<Value>(), 16);
    }

    #[test]
    fn test_inline_round_trips() {
        assert_eq!(Value::new_int(-7).as_int(), Some(-7));
        assert_eq!(Value::new_float(2.5).as_float(), Some(2.5));
        assert_eq!(Value::new_bool(true).as_bool(), Some(true));
        let (x, y) = Value::new_vec2(1.5, -2.0).payload().unwrap().as_vec2();
        assert_eq!((x, y), (1.5, -2.0));
        let (x, y) = Value::new_vec2i(3, -4).payload().unwrap().as_vec2i();
        assert_eq!((x, y), (3, -4));
    }

    #[test]
    fn test_nil_is_not_none() {
        assert!(Value::NIL.is_nil());
        assert!(!Value::NIL.is_none());
        assert!(Value::NONE.is_none());
        assert_ne!(Value::NIL, Value::NONE);
    }

    #[test]
    fn test_boxed_tag_queries() {
        let v = Value::Boxed(types::TP_STR, HeapId::from_index(5));
        assert!(v.is_ptr());
        assert_eq!(v.type_of(), types::TP_STR);
        assert_eq!(v.as_obj().unwrap().index(), 5);
        assert_eq!(v.as_int(), None);
    }
}
