//! Heap object payloads.
//!
//! Every heap object is a fixed header (see [`crate::heap::HeapObject`])
//! followed by an [`ObjPayload`]. The payload enum also carries the two GC
//! obligations of each shape: enumerating child values (`trace`) and an
//! approximate byte size used to pick a small-object pool class
//! (`estimate_size`).

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    bytecode::code::FuncDecl,
    error::RunResult,
    frame::Frame,
    intern::Name,
    types::TypeId,
    value::Value,
    vm::Vm,
};

/// Native callable ABI.
///
/// Arguments stay in place on the operand stack (`vm.arg(i)` reads them
/// relative to the saved call base); a successful call writes the retval
/// slot and returns `Ok(())`. On `Err` the retval slot is untouched.
pub type NativeFn = fn(&mut Vm, argc: usize, kwargc: usize) -> RunResult<()>;

/// A native function object.
#[derive(Clone, Copy)]
pub struct NativeFunc {
    /// Display name, used by `repr` and error messages.
    pub name: &'static str,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFunc({})", self.name)
    }
}

/// The per-instance attribute dictionary: interned name -> value.
///
/// Backed by an open-addressed table; most instances hold only a few
/// entries.
#[derive(Debug, Default)]
pub struct NameDict {
    map: AHashMap<Name, Value>,
}

impl NameDict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn get(&self, name: Name) -> Option<Value> {
        self.map.get(&name).copied()
    }

    #[inline]
    pub fn set(&mut self, name: Name, value: Value) {
        self.map.insert(name, value);
    }

    /// Removes an entry, returning whether it was present.
    pub fn delete(&mut self, name: Name) -> bool {
        self.map.remove(&name).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Name, Value)> + '_ {
        self.map.iter().map(|(&n, &v)| (n, v))
    }
}

/// One entry of a Python `dict`.
#[derive(Debug, Clone, Copy)]
pub struct DictEntry {
    pub hash: u64,
    pub key: Value,
    pub value: Value,
}

/// Insertion-ordered Python `dict` storage.
///
/// Entries live in a vector (deleted slots become tombstones so entry
/// indices stay stable); a hash index maps key hashes to candidate entry
/// positions. Key equality is decided by the VM (`__eq__` dispatch), so
/// this container only narrows candidates by hash; the VM finishes the
/// lookup.
#[derive(Debug, Default)]
pub struct Dict {
    entries: Vec<Option<DictEntry>>,
    index: hashbrown::HashMap<u64, SmallVec<[u32; 2]>, ahash::RandomState>,
    live: usize,
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Entry positions whose key hash equals `hash`, with their keys.
    #[must_use]
    pub fn candidates(&self, hash: u64) -> SmallVec<[(u32, Value); 4]> {
        let mut out = SmallVec::new();
        if let Some(positions) = self.index.get(&hash) {
            for &pos in positions {
                if let Some(entry) = &self.entries[pos as usize] {
                    out.push((pos, entry.key));
                }
            }
        }
        out
    }

    /// The value stored at an entry position returned by [`Self::candidates`].
    #[must_use]
    pub fn value_at(&self, pos: u32) -> Value {
        self.entries[pos as usize].as_ref().expect("dict entry vacated").value
    }

    /// Overwrites the value at a live entry position.
    pub fn set_value_at(&mut self, pos: u32, value: Value) {
        self.entries[pos as usize].as_mut().expect("dict entry vacated").value = value;
    }

    /// Appends a new entry. The caller has already established the key is
    /// absent.
    pub fn push(&mut self, hash: u64, key: Value, value: Value) {
        let pos = u32::try_from(self.entries.len()).expect("dict exceeds u32 entries");
        self.entries.push(Some(DictEntry { hash, key, value }));
        self.index.entry(hash).or_default().push(pos);
        self.live += 1;
    }

    /// Tombstones the entry at `pos`, returning its value.
    pub fn remove_at(&mut self, pos: u32) -> Value {
        let entry = self.entries[pos as usize].take().expect("dict entry vacated");
        if let Some(positions) = self.index.get_mut(&entry.hash) {
            positions.retain(|&mut p| p != pos);
            if positions.is_empty() {
                self.index.remove(&entry.hash);
            }
        }
        self.live -= 1;
        entry.value
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.live = 0;
    }

    /// Live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().flatten().map(|e| (e.key, e.value))
    }
}

/// A user-defined function: its compile-time declaration plus the values
/// captured at definition time.
#[derive(Debug)]
pub struct Function {
    pub decl: Arc<FuncDecl>,
    /// Defining module, consulted for global lookups.
    pub module: Value,
    /// Captured enclosing names, for closures.
    pub closure: Option<Box<NameDict>>,
    /// Default values, evaluated at `def` time. Positional defaults first,
    /// then keyword-only defaults in declaration order.
    pub defaults: Vec<Value>,
}

/// Exception instance payload. The exception's class is the object's type
/// tag; this carries the message and the accumulated traceback.
#[derive(Debug)]
pub struct ExcPayload {
    pub msg: Option<Box<str>>,
    /// The raw constructor argument when it was not a string (NIL if absent).
    pub arg: Value,
    /// Innermost-first traceback entries, pushed as unwinding crosses frames.
    pub traceback: Vec<TracebackEntry>,
}

/// One traceback line.
#[derive(Debug, Clone)]
pub struct TracebackEntry {
    pub func: Box<str>,
    pub line: u32,
}

/// Module identity, pre-split from the dotted registration path. The module
/// body's globals live in the heap object's attribute dictionary.
#[derive(Debug)]
pub struct ModuleInfo {
    pub name: Box<str>,
    pub package: Box<str>,
    pub path: Box<str>,
}

/// Generator lifecycle, a frame-state machine.
#[derive(Debug)]
pub enum GeneratorState {
    /// Parked between `__next__` calls; holds the frame and its saved
    /// operand-stack segment.
    Suspended { frame: Box<Frame>, saved_stack: Vec<Value> },
    /// Currently executing (guards against reentrant `__next__`).
    Running,
    /// Exhausted; every further `__next__` raises `StopIteration`.
    Done,
}

/// The payload of a heap object.
#[derive(Debug)]
pub enum ObjPayload {
    Str(Box<str>),
    List(Vec<Value>),
    Tuple(Box<[Value]>),
    Dict(Dict),
    Slice {
        start: Value,
        stop: Value,
        step: Value,
    },
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    RangeIterator {
        current: i64,
        stop: i64,
        step: i64,
    },
    /// Iterator over a list or tuple.
    ArrayIterator {
        seq: Value,
        index: usize,
    },
    /// Iterator over the characters of a string.
    StrIterator {
        s: Value,
        index: usize,
    },
    Function(Function),
    NativeFunc(NativeFunc),
    BoundMethod {
        func: Value,
        receiver: Value,
    },
    StaticMethod(Value),
    ClassMethod(Value),
    Property {
        getter: Value,
        setter: Value,
    },
    /// Two-argument `super(T, obj)`: lookups start at `T`'s base.
    Super {
        start: TypeId,
        receiver: Value,
    },
    Exception(ExcPayload),
    Module(ModuleInfo),
    /// A plain user-defined instance; all data lives in the header's
    /// attribute dictionary.
    Instance,
    Generator(Box<GeneratorState>),
    /// The payload of a type object.
    TypeRef(TypeId),
}

impl ObjPayload {
    /// Enumerates every `Value` directly held by this payload, for the GC
    /// mark phase. Attribute dictionaries are traced by the heap itself.
    pub fn trace(&self, mark: &mut dyn FnMut(Value)) {
        match self {
            Self::Str(_)
            | Self::Range { .. }
            | Self::RangeIterator { .. }
            | Self::NativeFunc(_)
            | Self::Module(_)
            | Self::Instance
            | Self::TypeRef(_) => {}
            Self::List(items) => {
                for &v in items {
                    mark(v);
                }
            }
            Self::Tuple(items) => {
                for &v in items.iter() {
                    mark(v);
                }
            }
            Self::Dict(dict) => {
                for (k, v) in dict.iter() {
                    mark(k);
                    mark(v);
                }
            }
            Self::Slice { start, stop, step } => {
                mark(*start);
                mark(*stop);
                mark(*step);
            }
            Self::ArrayIterator { seq, .. } => mark(*seq),
            Self::StrIterator { s, .. } => mark(*s),
            Self::Function(func) => {
                mark(func.module);
                if let Some(closure) = &func.closure {
                    for (_, v) in closure.iter() {
                        mark(v);
                    }
                }
                for &v in &func.defaults {
                    mark(v);
                }
            }
            Self::BoundMethod { func, receiver } => {
                mark(*func);
                mark(*receiver);
            }
            Self::StaticMethod(v) | Self::ClassMethod(v) => mark(*v),
            Self::Property { getter, setter } => {
                mark(*getter);
                mark(*setter);
            }
            Self::Super { receiver, .. } => mark(*receiver),
            Self::Exception(exc) => mark(exc.arg),
            Self::Generator(state) => {
                if let GeneratorState::Suspended { frame, saved_stack } = state.as_ref() {
                    frame.trace(mark);
                    for &v in saved_stack {
                        mark(v);
                    }
                }
            }
        }
    }

    /// Approximate payload size in bytes, used to choose a pool class.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        match self {
            Self::Str(s) => 16 + s.len(),
            Self::List(items) => 32 + items.len() * size_of::<Value>(),
            Self::Tuple(items) => 16 + items.len() * size_of::<Value>(),
            Self::Dict(dict) => 48 + dict.len() * 40,
            Self::Function(func) => 64 + func.defaults.len() * size_of::<Value>(),
            Self::Exception(_) => 64,
            Self::Generator(_) => 256,
            Self::Module(_) => 96,
            Self::Slice { .. } => 48,
            _ => 32,
        }
    }

    /// Short shape name, for heap statistics.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::List(_) => "List",
            Self::Tuple(_) => "Tuple",
            Self::Dict(_) => "Dict",
            Self::Slice { .. } => "Slice",
            Self::Range { .. } => "Range",
            Self::RangeIterator { .. } => "RangeIterator",
            Self::ArrayIterator { .. } => "ArrayIterator",
            Self::StrIterator { .. } => "StrIterator",
            Self::Function(_) => "Function",
            Self::NativeFunc(_) => "NativeFunc",
            Self::BoundMethod { .. } => "BoundMethod",
            Self::StaticMethod(_) => "StaticMethod",
            Self::ClassMethod(_) => "ClassMethod",
            Self::Property { .. } => "Property",
            Self::Super { .. } => "Super",
            Self::Exception(_) => "Exception",
            Self::Module(_) => "Module",
            Self::Instance => "Instance",
            Self::Generator(_) => "Generator",
            Self::TypeRef(_) => "TypeRef",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dict_push_and_tombstone() {
        let mut dict = Dict::new();
        dict.push(7, Value::new_int(1), Value::new_int(10));
        dict.push(7, Value::new_int(2), Value::new_int(20));
        dict.push(9, Value::new_int(3), Value::new_int(30));
        assert_eq!(dict.len(), 3);
        assert_eq!(dict.candidates(7).len(), 2);

        let (pos, _) = dict.candidates(7)[0];
        assert_eq!(dict.remove_at(pos), Value::new_int(10));
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.candidates(7).len(), 1);
        // insertion order survives tombstoning
        let keys: Vec<Value> = dict.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![Value::new_int(2), Value::new_int(3)]);
    }

    #[test]
    fn test_trace_visits_children() {
        let payload = ObjPayload::List(vec![Value::new_int(1), Value::NONE]);
        let mut seen = Vec::new();
        payload.trace(&mut |v| seen.push(v));
        assert_eq!(seen.len(), 2);
    }
}
