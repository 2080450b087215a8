//! The dense type table and magic-slot operator dispatch.
//!
//! Types are indexed densely from 0; the built-ins occupy a stable low
//! range (the `TP_*` constants). Each type carries a fixed-size array of
//! *magic slots*, one `Value` per canonical dunder name, so operator
//! dispatch is a single array index, never a hash lookup. Subclasses copy
//! their base's slots at creation time; there is no inheritance walk at
//! call time.

use strum::{EnumCount, EnumIter, FromRepr, IntoStaticStr};

use crate::{
    error::{ExcKind, RunError, RunResult},
    intern::Name,
    object::ObjPayload,
    value::Value,
};

/// A dense type index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TypeId(pub(crate) u16);

impl TypeId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

// Stable ids for the built-in types. The order is a registration contract:
// `Vm::new` registers exactly this sequence before anything else runs.
pub const TP_NIL: TypeId = TypeId(0);
pub const TP_OBJECT: TypeId = TypeId(1);
pub const TP_TYPE: TypeId = TypeId(2);
pub const TP_INT: TypeId = TypeId(3);
pub const TP_FLOAT: TypeId = TypeId(4);
pub const TP_BOOL: TypeId = TypeId(5);
pub const TP_NONE: TypeId = TypeId(6);
pub const TP_NOT_IMPLEMENTED: TypeId = TypeId(7);
pub const TP_VEC2: TypeId = TypeId(8);
pub const TP_VEC2I: TypeId = TypeId(9);
pub const TP_STR: TypeId = TypeId(10);
pub const TP_LIST: TypeId = TypeId(11);
pub const TP_TUPLE: TypeId = TypeId(12);
pub const TP_DICT: TypeId = TypeId(13);
pub const TP_SLICE: TypeId = TypeId(14);
pub const TP_RANGE: TypeId = TypeId(15);
pub const TP_RANGE_ITERATOR: TypeId = TypeId(16);
pub const TP_ARRAY_ITERATOR: TypeId = TypeId(17);
pub const TP_STR_ITERATOR: TypeId = TypeId(18);
pub const TP_FUNCTION: TypeId = TypeId(19);
pub const TP_NATIVEFUNC: TypeId = TypeId(20);
pub const TP_BOUNDMETHOD: TypeId = TypeId(21);
pub const TP_STATICMETHOD: TypeId = TypeId(22);
pub const TP_CLASSMETHOD: TypeId = TypeId(23);
pub const TP_PROPERTY: TypeId = TypeId(24);
pub const TP_SUPER: TypeId = TypeId(25);
pub const TP_MODULE: TypeId = TypeId(26);
pub const TP_GENERATOR: TypeId = TypeId(27);

/// Canonical magic-method names, in slot order.
///
/// The interner reserves ids `0..MAGIC_SLOT_COUNT` for these names so an
/// attribute `Name` converts to its slot with a range check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum MagicSlot {
    #[strum(serialize = "__new__")]
    New,
    #[strum(serialize = "__init__")]
    Init,
    #[strum(serialize = "__repr__")]
    Repr,
    #[strum(serialize = "__str__")]
    Str,
    #[strum(serialize = "__hash__")]
    Hash,
    #[strum(serialize = "__bool__")]
    Bool,
    #[strum(serialize = "__len__")]
    Len,
    #[strum(serialize = "__eq__")]
    Eq,
    #[strum(serialize = "__ne__")]
    Ne,
    #[strum(serialize = "__lt__")]
    Lt,
    #[strum(serialize = "__le__")]
    Le,
    #[strum(serialize = "__gt__")]
    Gt,
    #[strum(serialize = "__ge__")]
    Ge,
    #[strum(serialize = "__add__")]
    Add,
    #[strum(serialize = "__radd__")]
    Radd,
    #[strum(serialize = "__sub__")]
    Sub,
    #[strum(serialize = "__rsub__")]
    Rsub,
    #[strum(serialize = "__mul__")]
    Mul,
    #[strum(serialize = "__rmul__")]
    Rmul,
    #[strum(serialize = "__truediv__")]
    TrueDiv,
    #[strum(serialize = "__rtruediv__")]
    RTrueDiv,
    #[strum(serialize = "__floordiv__")]
    FloorDiv,
    #[strum(serialize = "__rfloordiv__")]
    RFloorDiv,
    #[strum(serialize = "__mod__")]
    Mod,
    #[strum(serialize = "__rmod__")]
    Rmod,
    #[strum(serialize = "__pow__")]
    Pow,
    #[strum(serialize = "__rpow__")]
    Rpow,
    #[strum(serialize = "__neg__")]
    Neg,
    #[strum(serialize = "__abs__")]
    Abs,
    #[strum(serialize = "__invert__")]
    Invert,
    #[strum(serialize = "__and__")]
    And,
    #[strum(serialize = "__rand__")]
    Rand,
    #[strum(serialize = "__or__")]
    Or,
    #[strum(serialize = "__ror__")]
    Ror,
    #[strum(serialize = "__xor__")]
    Xor,
    #[strum(serialize = "__rxor__")]
    Rxor,
    #[strum(serialize = "__lshift__")]
    Lshift,
    #[strum(serialize = "__rlshift__")]
    Rlshift,
    #[strum(serialize = "__rshift__")]
    Rshift,
    #[strum(serialize = "__rrshift__")]
    Rrshift,
    #[strum(serialize = "__iter__")]
    Iter,
    #[strum(serialize = "__next__")]
    Next,
    #[strum(serialize = "__getitem__")]
    GetItem,
    #[strum(serialize = "__setitem__")]
    SetItem,
    #[strum(serialize = "__delitem__")]
    DelItem,
    #[strum(serialize = "__contains__")]
    Contains,
    #[strum(serialize = "__call__")]
    Call,
    #[strum(serialize = "__enter__")]
    Enter,
    #[strum(serialize = "__exit__")]
    Exit,
    #[strum(serialize = "__divmod__")]
    Divmod,
    #[strum(serialize = "__round__")]
    Round,
}

/// Number of magic slots per type.
pub const MAGIC_SLOT_COUNT: usize = MagicSlot::COUNT;

impl MagicSlot {
    /// The canonical dunder name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Finaliser invoked on the payload during sweep, before deallocation.
pub type Dtor = fn(&mut ObjPayload);

/// Extra per-type GC hook: enumerates `Value` children the generic payload
/// trace cannot see (opaque native userdata).
pub type GcMarkHook = fn(&ObjPayload, &mut dyn FnMut(Value));

/// A type descriptor.
pub struct TypeInfo {
    /// Interned type name.
    pub name: Name,
    /// Base type; `TP_NIL` only for `object` itself.
    pub base: TypeId,
    /// The type object as a value (boxed `TypeRef` payload). Lives inside
    /// the heap-tracked graph; the type table is a GC root.
    pub self_value: Value,
    /// Module the type was defined in, or NIL for built-ins.
    pub module: Value,
    /// User-defined (class statement) vs native.
    pub is_python: bool,
    /// Sealed types cannot be subclassed.
    pub is_sealed: bool,
    /// Finaliser run at sweep.
    pub dtor: Option<Dtor>,
    /// Declared attribute annotations, in declaration order.
    pub annotated_fields: Vec<Name>,
    /// Extra GC mark hook.
    pub gc_mark: Option<GcMarkHook>,
    /// Operator dispatch table. NIL means the slot is empty.
    pub magic: [Value; MAGIC_SLOT_COUNT],
}

impl TypeInfo {
    /// Reads a magic slot; `None` when empty.
    #[inline]
    #[must_use]
    pub fn magic_slot(&self, slot: MagicSlot) -> Option<Value> {
        let v = self.magic[slot as usize];
        if v.is_nil() { None } else { Some(v) }
    }

    /// Writes a magic slot.
    #[inline]
    pub fn set_magic_slot(&mut self, slot: MagicSlot, value: Value) {
        self.magic[slot as usize] = value;
    }
}

/// The dense type registry.
pub struct TypeTable {
    types: Vec<TypeInfo>,
    /// Exception kind -> registered type id, filled during builtin setup.
    exc_ids: [TypeId; ExcKind::COUNT],
}

impl TypeTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: Vec::with_capacity(64),
            exc_ids: [TP_NIL; ExcKind::COUNT],
        }
    }

    /// Registers a new type. Fails with `TypeError` when the base is sealed.
    ///
    /// Magic slots are inherited by copying from the base; later overrides
    /// replace individual entries. `self_value` starts as NIL and is patched
    /// by the VM once the type object has been allocated.
    pub fn new_type(
        &mut self,
        name: Name,
        base: TypeId,
        module: Value,
        dtor: Option<Dtor>,
        is_python: bool,
        is_sealed: bool,
    ) -> RunResult<TypeId> {
        let magic = if base == TP_NIL {
            [Value::NIL; MAGIC_SLOT_COUNT]
        } else {
            let base_info = self.get(base);
            if base_info.is_sealed {
                return Err(RunError::type_error("type is not an acceptable base type"));
            }
            base_info.magic
        };
        let id = TypeId(u16::try_from(self.types.len()).expect("type table exceeds u16"));
        self.types.push(TypeInfo {
            name,
            base,
            self_value: Value::NIL,
            module,
            is_python,
            is_sealed,
            dtor,
            annotated_fields: Vec::new(),
            gc_mark: None,
            magic,
        });
        Ok(id)
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: TypeId) -> &TypeInfo {
        &self.types[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: TypeId) -> &mut TypeInfo {
        &mut self.types[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// True if `a` is `b` or derives from `b`.
    #[must_use]
    pub fn issubclass(&self, a: TypeId, b: TypeId) -> bool {
        let mut t = a;
        loop {
            if t == b {
                return true;
            }
            t = self.get(t).base;
            if t == TP_NIL {
                return false;
            }
        }
    }

    /// Installs a per-type GC mark hook.
    pub fn set_gc_mark(&mut self, id: TypeId, hook: GcMarkHook) {
        self.get_mut(id).gc_mark = Some(hook);
    }

    /// Records the type registered for a built-in exception kind.
    pub fn set_exc_type(&mut self, kind: ExcKind, id: TypeId) {
        self.exc_ids[kind as usize] = id;
    }

    /// The type registered for a built-in exception kind.
    #[must_use]
    pub fn exc_type(&self, kind: ExcKind) -> TypeId {
        self.exc_ids[kind as usize]
    }

    /// Reverse lookup of `exc_type`, for matching raised values back to
    /// their kind when formatting.
    #[must_use]
    pub fn exc_kind_of(&self, id: TypeId) -> Option<ExcKind> {
        use strum::IntoEnumIterator;
        ExcKind::iter().find(|&kind| self.exc_ids[kind as usize] == id)
    }

    /// Iterates all type descriptors (for GC root enumeration).
    pub fn iter(&self) -> impl Iterator<Item = &TypeInfo> {
        self.types.iter()
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interns;

    #[test]
    fn test_magic_slot_count_fits_budget() {
        assert!(MAGIC_SLOT_COUNT <= 64);
    }

    #[test]
    fn test_sealed_base_rejected() {
        let mut interns = Interns::new();
        let mut table = TypeTable::new();
        let object = table
            .new_type(interns.intern("object"), TP_NIL, Value::NIL, None, false, false)
            .unwrap();
        let sealed = table
            .new_type(interns.intern("sealed"), object, Value::NIL, None, false, true)
            .unwrap();
        assert!(table.new_type(interns.intern("sub"), sealed, Value::NIL, None, true, false).is_err());
    }

    #[test]
    fn test_slots_copied_to_subclass() {
        let mut interns = Interns::new();
        let mut table = TypeTable::new();
        let object = table
            .new_type(interns.intern("object"), TP_NIL, Value::NIL, None, false, false)
            .unwrap();
        table.get_mut(object).set_magic_slot(MagicSlot::Eq, Value::new_int(42));
        let sub = table
            .new_type(interns.intern("sub"), object, Value::NIL, None, true, false)
            .unwrap();
        assert_eq!(table.get(sub).magic_slot(MagicSlot::Eq), Some(Value::new_int(42)));
        assert!(table.issubclass(sub, object));
        assert!(!table.issubclass(object, sub));
    }
}
