//! The virtual machine.
//!
//! One `Vm` is one logical interpreter: a shared operand stack partitioned
//! across frames, the managed heap, the dense type table, the module
//! registry, and the retval / pending-exception slots. The run loop caches
//! the current frame's code and instruction pointer in locals and reloads
//! the cache whenever the frame stack changes (calls, returns, exception
//! handlers).

mod attr;
mod binary;
mod call;
mod exceptions;

use std::sync::Arc;

pub(crate) use call::CallAction;

use crate::{
    bytecode::code::{Code, Constant},
    error::{ExcKind, RunError, RunResult},
    frame::Frame,
    heap::Heap,
    hooks::{CompileError, CompileMode, Compiler, Hooks, StepInfo},
    intern::{Interns, Name},
    modules::ModuleRegistry,
    object::{GeneratorState, ObjPayload},
    pickle::PickleRegistry,
    types::{self, MagicSlot, TypeId, TypeTable},
    value::{HeapId, Value},
};

use crate::bytecode::op::Opcode;

/// Fixed operand-stack capacity; overflow is fatal.
pub const STACK_SIZE: usize = 32 * 1024;

/// Scratch-buffer capacity for argument binding; bounds a code object's
/// parameter count.
pub const MAX_CO_VARNAMES: usize = 64;

/// Default frame-depth limit; exceeding it raises `RecursionError`.
pub const DEFAULT_RECURSION_LIMIT: usize = 1000;

/// What the run loop hands back to its driver.
#[derive(Debug)]
pub(crate) enum FrameSignal {
    /// The entry frame returned a value.
    Returned(Value),
    /// The entry frame was a generator frame and yielded.
    Yielded(Value),
}

/// Locally cached frame state for the run loop.
struct CachedFrame {
    code: Arc<Code>,
    ip: usize,
}

/// Fetches one bytecode byte, advancing the cached ip.
macro_rules! fetch_byte {
    ($cached:expr) => {{
        let byte = $cached.code.bytecode()[$cached.ip];
        $cached.ip += 1;
        byte
    }};
}

macro_rules! fetch_u8 {
    ($cached:expr) => {
        fetch_byte!($cached)
    };
}

macro_rules! fetch_i8 {
    ($cached:expr) => {{ i8::from_ne_bytes([fetch_byte!($cached)]) }};
}

macro_rules! fetch_u16 {
    ($cached:expr) => {{
        let lo = $cached.code.bytecode()[$cached.ip];
        let hi = $cached.code.bytecode()[$cached.ip + 1];
        $cached.ip += 2;
        u16::from_le_bytes([lo, hi])
    }};
}

macro_rules! fetch_i16 {
    ($cached:expr) => {{
        let lo = $cached.code.bytecode()[$cached.ip];
        let hi = $cached.code.bytecode()[$cached.ip + 1];
        $cached.ip += 2;
        i16::from_le_bytes([lo, hi])
    }};
}

/// Reloads the cache after any frame-stack mutation.
macro_rules! reload_cache {
    ($self:expr, $cached:ident) => {{
        let frame = $self.current_frame();
        $cached = CachedFrame {
            code: frame.code.clone(),
            ip: frame.ip,
        };
    }};
}

/// Applies a relative jump to the cached ip.
macro_rules! jump_relative {
    ($ip:expr, $offset:expr) => {{
        let base = i64::try_from($ip).expect("ip exceeds i64");
        let target = base + i64::from($offset);
        $ip = usize::try_from(target).expect("jump produced a negative ip");
    }};
}

/// Evaluates a fallible expression inside the run loop. On error, syncs the
/// instruction pointer, unwinds (possibly jumping to a handler in another
/// frame), reloads the cache and continues the loop.
macro_rules! vm_try {
    ($self:expr, $cached:ident, $base:expr, $expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(err) => {
                $self.unwind(err, $base)?;
                reload_cache!($self, $cached);
                continue;
            }
        }
    };
}

/// The interpreter state. One per VM slot.
pub struct Vm {
    /// The shared operand stack, partitioned across frames.
    pub(crate) stack: Vec<Value>,
    /// The call stack; the last element is the executing frame.
    pub(crate) frames: Vec<Frame>,
    pub(crate) heap: Heap,
    pub(crate) types: TypeTable,
    pub(crate) interns: Interns,
    pub(crate) modules: ModuleRegistry,
    /// The `builtins` module.
    pub(crate) builtins: Value,
    /// The `__main__` module.
    pub(crate) main: Value,
    /// Result of the most recent successful call.
    pub(crate) retval: Value,
    /// Pending exception during unwinding, or the caught-but-uncleared
    /// exception inside a handler.
    pub(crate) curr_exception: Option<Value>,
    /// True between handler entry and `PopException`.
    pub(crate) is_curr_exc_handled: bool,
    /// Set when `FOR_ITER` absorbed a `StopIteration`.
    pub(crate) is_stopiteration: bool,
    /// Host-side scratch registers; GC roots.
    pub reg: [Value; 8],
    /// Scratch buffer for argument binding.
    pub(crate) scratch: Vec<Value>,
    /// Argument window base of the executing native call.
    pub(crate) native_base: usize,
    pub(crate) hooks: Hooks,
    pub(crate) compiler: Option<Box<dyn Compiler>>,
    pub(crate) pickle: PickleRegistry,
    /// Seed state for builtin hashing; one per VM so hashes are stable
    /// within a slot.
    pub(crate) hash_state: ahash::RandomState,
    recursion_limit: usize,
}

impl Vm {
    /// Constructs a VM with stdio hooks and the built-in types registered.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hooks(Hooks::stdio())
    }

    /// Constructs a VM with the given host hooks.
    #[must_use]
    pub fn with_hooks(hooks: Hooks) -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_SIZE),
            frames: Vec::with_capacity(64),
            heap: Heap::new(),
            types: TypeTable::new(),
            interns: Interns::new(),
            modules: ModuleRegistry::new(),
            builtins: Value::NIL,
            main: Value::NIL,
            retval: Value::NIL,
            curr_exception: None,
            is_curr_exc_handled: false,
            is_stopiteration: false,
            reg: [Value::NIL; 8],
            scratch: Vec::with_capacity(MAX_CO_VARNAMES),
            native_base: 0,
            hooks,
            compiler: None,
            pickle: PickleRegistry::new(),
            hash_state: ahash::RandomState::new(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        };
        crate::builtins::register(&mut vm);
        vm
    }

    /// Installs the external compiler.
    pub fn set_compiler(&mut self, compiler: Box<dyn Compiler>) {
        self.compiler = Some(compiler);
    }

    /// Adjusts the frame-depth limit.
    pub fn set_recursion_limit(&mut self, limit: usize) {
        self.recursion_limit = limit;
    }

    /// The `__main__` module object.
    #[must_use]
    pub fn main_module(&self) -> Value {
        self.main
    }

    /// The `builtins` module object.
    #[must_use]
    pub fn builtins_module(&self) -> Value {
        self.builtins
    }

    /// Current operand-stack depth (empty between top-level executions).
    #[must_use]
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// The retval slot: the result of the most recent successful call.
    #[must_use]
    pub fn retval(&self) -> Value {
        self.retval
    }

    // ------------------------------------------------------------------
    // Operand stack
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn push(&mut self, v: Value) {
        assert!(self.stack.len() < STACK_SIZE, "value stack overflow");
        self.stack.push(v);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    /// The k-th value from the top (0 = top).
    #[inline]
    pub(crate) fn peek(&self, k: usize) -> Value {
        self.stack[self.stack.len() - 1 - k]
    }

    #[inline]
    pub(crate) fn current_frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    #[inline]
    pub(crate) fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    /// Positional argument of the executing native call.
    #[inline]
    #[must_use]
    pub fn arg(&self, i: usize) -> Value {
        self.stack[self.native_base + i]
    }

    /// Keyword pair `(key, value)` of the executing native call.
    #[inline]
    #[must_use]
    pub fn kwarg(&self, argc: usize, i: usize) -> (Value, Value) {
        let base = self.native_base + argc + 2 * i;
        (self.stack[base], self.stack[base + 1])
    }

    // ------------------------------------------------------------------
    // Heap conveniences
    // ------------------------------------------------------------------

    /// Allocates a string object.
    pub fn new_str(&mut self, s: &str) -> Value {
        let id = self.heap.alloc(types::TP_STR, ObjPayload::Str(s.into()));
        Value::Boxed(types::TP_STR, id)
    }

    /// Allocates a list object.
    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        let id = self.heap.alloc(types::TP_LIST, ObjPayload::List(items));
        Value::Boxed(types::TP_LIST, id)
    }

    /// Allocates a tuple object.
    pub fn new_tuple(&mut self, items: Vec<Value>) -> Value {
        let id = self.heap.alloc(types::TP_TUPLE, ObjPayload::Tuple(items.into_boxed_slice()));
        Value::Boxed(types::TP_TUPLE, id)
    }

    /// Reads a string payload.
    #[must_use]
    pub fn str_of(&self, v: Value) -> Option<&str> {
        match v {
            Value::Boxed(t, id) if t == types::TP_STR => match self.heap.payload(id) {
                ObjPayload::Str(s) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    /// The type id a type object stands for, when `v` is a type object.
    #[must_use]
    pub(crate) fn as_type_id(&self, v: Value) -> Option<TypeId> {
        match v {
            Value::Boxed(t, id) if t == types::TP_TYPE => match self.heap.payload(id) {
                ObjPayload::TypeRef(tid) => Some(*tid),
                _ => None,
            },
            _ => None,
        }
    }

    /// A magic slot of a type, `None` when empty.
    #[inline]
    #[must_use]
    pub(crate) fn magic_of(&self, t: TypeId, slot: MagicSlot) -> Option<Value> {
        self.types.get(t).magic_slot(slot)
    }

    /// Display name of a type.
    #[must_use]
    pub fn type_name(&self, t: TypeId) -> &str {
        self.interns.str_of(self.types.get(t).name)
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    /// Snapshot of the managed heap.
    #[must_use]
    pub fn heap_stats(&self) -> crate::heap::HeapStats {
        self.heap.stats()
    }

    /// Live objects on the managed heap.
    #[must_use]
    pub fn heap_live_count(&self) -> usize {
        self.heap.live_count()
    }

    /// Runs a full collection, returning the number of objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        let stack = &self.stack;
        let frames = &self.frames;
        let modules = &self.modules;
        let builtins = self.builtins;
        let main = self.main;
        let retval = self.retval;
        let exc = self.curr_exception;
        let regs = self.reg;
        let scratch = &self.scratch;
        let types_table = &self.types;
        self.heap.collect(types_table, |mark| {
            for &v in stack {
                mark(v);
            }
            for frame in frames {
                frame.trace(mark);
            }
            for (_, v) in modules.iter() {
                mark(v);
            }
            mark(builtins);
            mark(main);
            mark(retval);
            if let Some(e) = exc {
                mark(e);
            }
            for &v in &regs {
                mark(v);
            }
            for &v in scratch {
                mark(v);
            }
            for info in types_table.iter() {
                mark(info.self_value);
                mark(info.module);
                for &v in &info.magic {
                    mark(v);
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Drivers
    // ------------------------------------------------------------------

    /// Interns a code object's name pool for frame-local lookup.
    pub(crate) fn intern_name_pool(&mut self, code: &Code) -> Box<[Name]> {
        code.names()
            .iter()
            .map(|s| self.interns.intern(s))
            .collect::<Vec<_>>()
            .into_boxed_slice()
    }

    /// Executes a code object at module level and returns its result.
    pub fn exec_code(&mut self, code: Code, module: Value) -> RunResult<Value> {
        self.exec_code_arc(Arc::new(code), module)
    }

    /// Executes an already-shared code object at module level.
    pub fn exec_code_arc(&mut self, code: Arc<Code>, module: Value) -> RunResult<Value> {
        if self.frames.len() >= self.recursion_limit {
            return Err(RunError::recursion_error());
        }
        let names = self.intern_name_pool(&code);
        let frame = Frame::new(code, module, Value::NIL, self.stack.len(), names);
        self.frames.push(frame);
        match self.run_top_frame()? {
            FrameSignal::Returned(v) | FrameSignal::Yielded(v) => Ok(v),
        }
    }

    /// Compiles source through the installed compiler hook.
    pub fn compile(&mut self, source: &str, mode: CompileMode, filename: &str) -> Result<Code, CompileError> {
        match &mut self.compiler {
            Some(compiler) => compiler.compile(source, mode, filename),
            None => Err(CompileError::NoCompiler),
        }
    }

    /// Compiles and executes source into `module`. Compile failures become
    /// `SyntaxError` exceptions; `json` mode is served natively.
    pub fn exec_source(&mut self, source: &str, filename: &str, mode: CompileMode, module: Value) -> RunResult<Value> {
        if mode == CompileMode::Json {
            return self.json_loads(source);
        }
        let code = self
            .compile(source, mode, filename)
            .map_err(|e| RunError::Raise(ExcKind::SyntaxError, Some(e.to_string())))?;
        self.exec_code(code, module)
    }

    /// Loads a JSON-literal expression directly into values.
    pub fn json_loads(&mut self, source: &str) -> RunResult<Value> {
        let parsed: serde_json::Value = serde_json::from_str(source)
            .map_err(|e| RunError::value_error(format!("invalid JSON: {e}")))?;
        Ok(self.json_to_value(&parsed))
    }

    fn json_to_value(&mut self, v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::NONE,
            serde_json::Value::Bool(b) => Value::new_bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::new_int(i)
                } else {
                    Value::new_float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => self.new_str(s),
            serde_json::Value::Array(items) => {
                let values: Vec<Value> = items.iter().map(|item| self.json_to_value(item)).collect();
                self.new_list(values)
            }
            serde_json::Value::Object(map) => {
                // lock spans the window where fresh keys/values are not yet
                // reachable from the dict under construction
                self.heap.lock_gc();
                let dict = self.new_dict();
                for (k, v) in map {
                    let key = self.new_str(k);
                    let value = self.json_to_value(v);
                    self.dict_set(dict, key, value).expect("string keys always hash");
                }
                self.heap.unlock_gc();
                dict
            }
        }
    }

    /// Allocates an empty dict object.
    pub fn new_dict(&mut self) -> Value {
        let id = self.heap.alloc(types::TP_DICT, ObjPayload::Dict(crate::object::Dict::new()));
        Value::Boxed(types::TP_DICT, id)
    }

    /// Allocates a range object.
    pub fn new_range(&mut self, start: i64, stop: i64, step: i64) -> Value {
        let id = self.heap.alloc(types::TP_RANGE, ObjPayload::Range { start, stop, step });
        Value::Boxed(types::TP_RANGE, id)
    }

    /// The elements of a tuple (or list) value.
    pub fn tuple_items(&self, v: Value) -> RunResult<Vec<Value>> {
        match v.as_obj().map(|id| self.heap.payload(id)) {
            Some(ObjPayload::Tuple(items)) => Ok(items.to_vec()),
            Some(ObjPayload::List(items)) => Ok(items.clone()),
            _ => Err(RunError::type_error("expected a tuple")),
        }
    }

    /// Drains any iterable into a vector through the iterator protocol.
    pub fn iter_to_vec(&mut self, v: Value) -> RunResult<Vec<Value>> {
        match v.as_obj().map(|id| self.heap.payload(id)) {
            Some(ObjPayload::List(items)) => return Ok(items.clone()),
            Some(ObjPayload::Tuple(items)) => return Ok(items.to_vec()),
            _ => {}
        }
        let it = self.py_iter(v)?;
        // the accumulator is not reachable from any root while user
        // __next__ code runs, so collection is deferred
        self.heap.lock_gc();
        let result: RunResult<Vec<Value>> = (|| {
            let mut out = Vec::new();
            while let Some(item) = self.py_next(it)? {
                out.push(item);
            }
            Ok(out)
        })();
        self.heap.unlock_gc();
        result
    }

    // ------------------------------------------------------------------
    // The interpreter loop
    // ------------------------------------------------------------------

    /// Runs the topmost frame to completion (or first yield), driving every
    /// frame it pushes. Returns control when the entry frame returns,
    /// yields, or unwinds out.
    pub(crate) fn run_top_frame(&mut self) -> RunResult<FrameSignal> {
        let base_frames = self.frames.len() - 1;
        let mut cached;
        reload_cache!(self, cached);

        loop {
            // collection happens only here, between instructions, when the
            // allocation counter trips and the GC lock is free
            if self.heap.should_gc() {
                self.current_frame_mut().ip = cached.ip;
                self.collect_garbage();
            }

            let instruction_ip = cached.ip;
            let opcode = Opcode::try_from(fetch_byte!(cached)).expect("invalid opcode in bytecode");

            if self.hooks.ceval_on_step.is_some() {
                let info = StepInfo {
                    ip: instruction_ip,
                    opcode,
                    frame_depth: self.frames.len(),
                };
                self.current_frame_mut().ip = cached.ip;
                let step = self.hooks.ceval_on_step.as_mut().expect("step hook vanished")(&info);
                vm_try!(self, cached, base_frames, step);
            }

            match opcode {
                Opcode::Nop => {}

                // ====================================================
                // Stack manipulation
                // ====================================================
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Dup => {
                    let v = self.peek(0);
                    self.push(v);
                }
                Opcode::Rot2 => {
                    let len = self.stack.len();
                    self.stack.swap(len - 1, len - 2);
                }

                // ====================================================
                // Constants
                // ====================================================
                Opcode::LoadConst => {
                    let idx = fetch_u16!(cached);
                    let v = match cached.code.const_at(idx) {
                        Constant::None => Value::NONE,
                        Constant::Bool(b) => Value::new_bool(*b),
                        Constant::Int(i) => Value::new_int(*i),
                        Constant::Float(f) => Value::new_float(*f),
                        Constant::Str(s) => {
                            let s = s.clone();
                            self.new_str(&s)
                        }
                    };
                    self.push(v);
                }
                Opcode::LoadNone => self.push(Value::NONE),
                Opcode::LoadTrue => self.push(Value::new_bool(true)),
                Opcode::LoadFalse => self.push(Value::new_bool(false)),
                Opcode::LoadSmallInt => {
                    let n = fetch_i8!(cached);
                    self.push(Value::new_int(i64::from(n)));
                }

                // ====================================================
                // Locals
                // ====================================================
                Opcode::LoadFast => {
                    let slot = usize::from(fetch_u8!(cached));
                    let v = self.current_frame().locals[slot];
                    if v.is_nil() {
                        let name = cached.code.varnames()[slot].clone();
                        self.current_frame_mut().ip = cached.ip;
                        vm_try!(
                            self,
                            cached,
                            base_frames,
                            Err::<(), _>(RunError::Raise(
                                ExcKind::NameError,
                                Some(format!("local variable '{name}' referenced before assignment")),
                            ))
                        );
                    }
                    self.push(v);
                }
                Opcode::StoreFast => {
                    let slot = usize::from(fetch_u8!(cached));
                    let v = self.pop();
                    self.current_frame_mut().locals[slot] = v;
                }
                Opcode::DeleteFast => {
                    let slot = usize::from(fetch_u8!(cached));
                    self.current_frame_mut().locals[slot] = Value::NIL;
                }

                // ====================================================
                // Names and globals
                // ====================================================
                Opcode::LoadName => {
                    let idx = fetch_u16!(cached);
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.load_name(idx));
                    self.push(v);
                }
                Opcode::StoreName | Opcode::StoreGlobal => {
                    let idx = fetch_u16!(cached);
                    let v = self.pop();
                    let name = self.current_frame().names[usize::from(idx)];
                    let module = self.current_frame().module;
                    self.set_module_attr(module, name, v);
                }
                Opcode::DeleteName | Opcode::DeleteGlobal => {
                    let idx = fetch_u16!(cached);
                    self.current_frame_mut().ip = cached.ip;
                    vm_try!(self, cached, base_frames, self.delete_global(idx));
                }
                Opcode::LoadGlobal => {
                    let idx = fetch_u16!(cached);
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.load_global(idx));
                    self.push(v);
                }

                // ====================================================
                // Attributes
                // ====================================================
                Opcode::LoadAttr => {
                    let idx = fetch_u16!(cached);
                    let name = self.current_frame().names[usize::from(idx)];
                    let obj = self.pop();
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.py_getattr(obj, name));
                    self.push(v);
                }
                Opcode::StoreAttr => {
                    let idx = fetch_u16!(cached);
                    let name = self.current_frame().names[usize::from(idx)];
                    let obj = self.pop();
                    let value = self.pop();
                    self.current_frame_mut().ip = cached.ip;
                    vm_try!(self, cached, base_frames, self.py_setattr(obj, name, value));
                }
                Opcode::DeleteAttr => {
                    let idx = fetch_u16!(cached);
                    let name = self.current_frame().names[usize::from(idx)];
                    let obj = self.pop();
                    self.current_frame_mut().ip = cached.ip;
                    vm_try!(self, cached, base_frames, self.py_delattr(obj, name));
                }

                // ====================================================
                // Subscripts
                // ====================================================
                Opcode::LoadSubscr => {
                    let key = self.pop();
                    let obj = self.pop();
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.call_magic_required(MagicSlot::GetItem, &[obj, key]));
                    self.push(v);
                }
                Opcode::StoreSubscr => {
                    let key = self.pop();
                    let obj = self.pop();
                    let value = self.pop();
                    self.current_frame_mut().ip = cached.ip;
                    vm_try!(
                        self,
                        cached,
                        base_frames,
                        self.call_magic_required(MagicSlot::SetItem, &[obj, key, value])
                    );
                }
                Opcode::DeleteSubscr => {
                    let key = self.pop();
                    let obj = self.pop();
                    self.current_frame_mut().ip = cached.ip;
                    vm_try!(self, cached, base_frames, self.call_magic_required(MagicSlot::DelItem, &[obj, key]));
                }

                // ====================================================
                // Binary arithmetic
                // ====================================================
                Opcode::BinaryAdd => {
                    // int+int fast path dominates arithmetic-heavy code
                    let len = self.stack.len();
                    if len >= 2
                        && let (Some(a), Some(b)) = (self.stack[len - 2].as_int(), self.stack[len - 1].as_int())
                    {
                        let r = vm_try!(self, cached, base_frames, {
                            self.current_frame_mut().ip = cached.ip;
                            a.checked_add(b).ok_or_else(|| RunError::overflow("integer addition overflow"))
                        });
                        self.stack.truncate(len - 2);
                        self.push(Value::new_int(r));
                        continue;
                    }
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::Add, Some(MagicSlot::Radd), "+"));
                    self.push(v);
                }
                Opcode::BinarySub => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::Sub, Some(MagicSlot::Rsub), "-"));
                    self.push(v);
                }
                Opcode::BinaryMul => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::Mul, Some(MagicSlot::Rmul), "*"));
                    self.push(v);
                }
                Opcode::BinaryTrueDiv => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(
                        self,
                        cached,
                        base_frames,
                        self.binary_op(MagicSlot::TrueDiv, Some(MagicSlot::RTrueDiv), "/")
                    );
                    self.push(v);
                }
                Opcode::BinaryFloorDiv => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(
                        self,
                        cached,
                        base_frames,
                        self.binary_op(MagicSlot::FloorDiv, Some(MagicSlot::RFloorDiv), "//")
                    );
                    self.push(v);
                }
                Opcode::BinaryMod => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::Mod, Some(MagicSlot::Rmod), "%"));
                    self.push(v);
                }
                Opcode::BinaryPow => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::Pow, Some(MagicSlot::Rpow), "**"));
                    self.push(v);
                }
                Opcode::BinaryAnd => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::And, Some(MagicSlot::Rand), "&"));
                    self.push(v);
                }
                Opcode::BinaryOr => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::Or, Some(MagicSlot::Ror), "|"));
                    self.push(v);
                }
                Opcode::BinaryXor => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::Xor, Some(MagicSlot::Rxor), "^"));
                    self.push(v);
                }
                Opcode::BinaryLShift => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(
                        self,
                        cached,
                        base_frames,
                        self.binary_op(MagicSlot::Lshift, Some(MagicSlot::Rlshift), "<<")
                    );
                    self.push(v);
                }
                Opcode::BinaryRShift => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(
                        self,
                        cached,
                        base_frames,
                        self.binary_op(MagicSlot::Rshift, Some(MagicSlot::Rrshift), ">>")
                    );
                    self.push(v);
                }

                // ====================================================
                // Comparison
                // ====================================================
                Opcode::CompareEq => {
                    self.current_frame_mut().ip = cached.ip;
                    let rhs = self.pop();
                    let lhs = self.pop();
                    let b = vm_try!(self, cached, base_frames, self.py_eq(lhs, rhs));
                    self.push(Value::new_bool(b));
                }
                Opcode::CompareNe => {
                    self.current_frame_mut().ip = cached.ip;
                    let rhs = self.pop();
                    let lhs = self.pop();
                    let b = vm_try!(self, cached, base_frames, self.py_ne(lhs, rhs));
                    self.push(Value::new_bool(b));
                }
                Opcode::CompareLt => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::Lt, Some(MagicSlot::Gt), "<"));
                    self.push(v);
                }
                Opcode::CompareLe => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::Le, Some(MagicSlot::Ge), "<="));
                    self.push(v);
                }
                Opcode::CompareGt => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::Gt, Some(MagicSlot::Lt), ">"));
                    self.push(v);
                }
                Opcode::CompareGe => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.binary_op(MagicSlot::Ge, Some(MagicSlot::Le), ">="));
                    self.push(v);
                }
                Opcode::IsOp => {
                    let invert = fetch_u8!(cached) != 0;
                    let rhs = self.pop();
                    let lhs = self.pop();
                    let same = self.is_identical(lhs, rhs);
                    self.push(Value::new_bool(same != invert));
                }
                Opcode::ContainsOp => {
                    let invert = fetch_u8!(cached) != 0;
                    let container = self.pop();
                    let item = self.pop();
                    self.current_frame_mut().ip = cached.ip;
                    let result = vm_try!(
                        self,
                        cached,
                        base_frames,
                        self.call_magic_required(MagicSlot::Contains, &[container, item])
                    );
                    let b = vm_try!(self, cached, base_frames, self.py_bool(result));
                    self.push(Value::new_bool(b != invert));
                }

                // ====================================================
                // Unary
                // ====================================================
                Opcode::UnaryNeg => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = self.pop();
                    let result = vm_try!(self, cached, base_frames, self.unary_neg(v));
                    self.push(result);
                }
                Opcode::UnaryNot => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = self.pop();
                    let b = vm_try!(self, cached, base_frames, self.py_bool(v));
                    self.push(Value::new_bool(!b));
                }
                Opcode::UnaryInvert => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = self.pop();
                    let result = vm_try!(self, cached, base_frames, self.unary_invert(v));
                    self.push(result);
                }

                // ====================================================
                // Control flow
                // ====================================================
                Opcode::Jump => {
                    let offset = fetch_i16!(cached);
                    jump_relative!(cached.ip, offset);
                }
                Opcode::PopJumpIfFalse => {
                    let offset = fetch_i16!(cached);
                    self.current_frame_mut().ip = cached.ip;
                    let v = self.pop();
                    let b = vm_try!(self, cached, base_frames, self.py_bool(v));
                    if !b {
                        jump_relative!(cached.ip, offset);
                    }
                }
                Opcode::PopJumpIfTrue => {
                    let offset = fetch_i16!(cached);
                    self.current_frame_mut().ip = cached.ip;
                    let v = self.pop();
                    let b = vm_try!(self, cached, base_frames, self.py_bool(v));
                    if b {
                        jump_relative!(cached.ip, offset);
                    }
                }
                Opcode::JumpBreak => {
                    let offset = fetch_i16!(cached);
                    let mut target = cached.ip;
                    jump_relative!(target, offset);
                    let frame = self.frames.last().expect("no active frame");
                    frame.prepare_jump_break(&mut self.stack, instruction_ip, target);
                    cached.ip = target;
                }
                Opcode::GetIter => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = self.pop();
                    let it = vm_try!(self, cached, base_frames, self.py_iter(v));
                    self.push(it);
                }
                Opcode::ForIter => {
                    let offset = fetch_i16!(cached);
                    self.current_frame_mut().ip = cached.ip;
                    let it = self.peek(0);
                    match vm_try!(self, cached, base_frames, self.py_next(it)) {
                        Some(v) => {
                            self.is_stopiteration = false;
                            self.push(v);
                        }
                        None => {
                            self.is_stopiteration = true;
                            self.pop(); // the iterator
                            jump_relative!(cached.ip, offset);
                        }
                    }
                }

                // ====================================================
                // Exceptions
                // ====================================================
                Opcode::Raise => {
                    self.current_frame_mut().ip = cached.ip;
                    let v = self.pop();
                    let err = vm_try!(self, cached, base_frames, self.raise_value(v));
                    self.unwind(err, base_frames)?;
                    reload_cache!(self, cached);
                }
                Opcode::Reraise => {
                    self.current_frame_mut().ip = cached.ip;
                    let err = vm_try!(self, cached, base_frames, self.reraise_error());
                    self.unwind(err, base_frames)?;
                    reload_cache!(self, cached);
                }
                Opcode::ExcMatch => {
                    self.current_frame_mut().ip = cached.ip;
                    let cls = self.pop();
                    let exc = self.peek(0);
                    let matched = vm_try!(self, cached, base_frames, self.exc_matches(exc, cls));
                    self.push(Value::new_bool(matched));
                }
                Opcode::PopException => {
                    self.pop();
                    self.clear_exc();
                }

                // ====================================================
                // Returns and yields
                // ====================================================
                Opcode::ReturnValue => {
                    let value = self.pop();
                    self.retval = value;
                    let frame = self.frames.pop().expect("return without frame");
                    self.stack.truncate(frame.p0);
                    if let Some(gid) = frame.gen_slot {
                        self.set_generator_state(gid, GeneratorState::Done);
                    }
                    let produced = if frame.init_instance.is_nil() {
                        self.retval
                    } else {
                        frame.init_instance
                    };
                    if self.frames.len() == base_frames {
                        return Ok(FrameSignal::Returned(produced));
                    }
                    self.push(produced);
                    reload_cache!(self, cached);
                }
                Opcode::YieldValue => {
                    let value = self.pop();
                    self.retval = value;
                    let mut frame = self.frames.pop().expect("yield without frame");
                    frame.ip = cached.ip;
                    let saved_stack = self.stack.split_off(frame.p0);
                    let Some(gid) = frame.gen_slot else {
                        return Err(RunError::runtime_error("yield outside generator"));
                    };
                    self.set_generator_state(
                        gid,
                        GeneratorState::Suspended {
                            frame: Box::new(frame),
                            saved_stack,
                        },
                    );
                    debug_assert_eq!(self.frames.len(), base_frames, "generator frames run individually");
                    return Ok(FrameSignal::Yielded(value));
                }

                // ====================================================
                // Context managers
                // ====================================================
                Opcode::WithEnter => {
                    self.current_frame_mut().ip = cached.ip;
                    let ctx = self.peek(0);
                    let entered = vm_try!(self, cached, base_frames, self.call_magic_required(MagicSlot::Enter, &[ctx]));
                    self.push(entered);
                }
                Opcode::WithExit => {
                    self.current_frame_mut().ip = cached.ip;
                    let ctx = self.pop();
                    vm_try!(self, cached, base_frames, self.call_magic_required(MagicSlot::Exit, &[ctx]));
                }

                // ====================================================
                // Calls
                // ====================================================
                Opcode::Call => {
                    let argc = u16::from(fetch_u8!(cached));
                    let kwargc = u16::from(fetch_u8!(cached));
                    self.current_frame_mut().ip = cached.ip;
                    match vm_try!(self, cached, base_frames, self.vectorcall(argc, kwargc)) {
                        CallAction::Returned => {}
                        CallAction::FramePushed => reload_cache!(self, cached),
                    }
                }

                // ====================================================
                // Builders
                // ====================================================
                Opcode::UnpackSequence => {
                    let count = usize::from(fetch_u8!(cached));
                    self.current_frame_mut().ip = cached.ip;
                    let seq = self.pop();
                    vm_try!(self, cached, base_frames, self.unpack_sequence(seq, count));
                }
                Opcode::BuildList => {
                    let count = usize::from(fetch_u16!(cached));
                    let base = self.stack.len() - count;
                    let items: Vec<Value> = self.stack.split_off(base);
                    let v = self.new_list(items);
                    self.push(v);
                }
                Opcode::BuildTuple => {
                    let count = usize::from(fetch_u16!(cached));
                    let base = self.stack.len() - count;
                    let items: Vec<Value> = self.stack.split_off(base);
                    let v = self.new_tuple(items);
                    self.push(v);
                }
                Opcode::BuildDict => {
                    let pairs = usize::from(fetch_u16!(cached));
                    self.current_frame_mut().ip = cached.ip;
                    let base = self.stack.len() - 2 * pairs;
                    let dict = self.new_dict();
                    for i in 0..pairs {
                        let key = self.stack[base + 2 * i];
                        let value = self.stack[base + 2 * i + 1];
                        vm_try!(self, cached, base_frames, self.dict_set(dict, key, value));
                    }
                    self.stack.truncate(base);
                    self.push(dict);
                }
                Opcode::BuildSlice => {
                    let count = fetch_u8!(cached);
                    let step = if count == 3 { self.pop() } else { Value::NONE };
                    let stop = self.pop();
                    let start = self.pop();
                    let id = self.heap.alloc(types::TP_SLICE, ObjPayload::Slice { start, stop, step });
                    self.push(Value::Boxed(types::TP_SLICE, id));
                }
                Opcode::MakeFunction => {
                    let decl_idx = fetch_u16!(cached);
                    let defaults_count = usize::from(fetch_u8!(cached));
                    let base = self.stack.len() - defaults_count;
                    let defaults: Vec<Value> = self.stack.split_off(base);
                    let v = self.make_function(&cached.code.clone(), decl_idx, defaults);
                    self.push(v);
                }
                Opcode::BuildClass => {
                    let name_idx = fetch_u16!(cached);
                    let has_base = fetch_u8!(cached) != 0;
                    self.current_frame_mut().ip = cached.ip;
                    let v = vm_try!(self, cached, base_frames, self.build_class(name_idx, has_base));
                    self.push(v);
                }
                Opcode::ImportName => {
                    let idx = fetch_u16!(cached);
                    let path = cached.code.name_at(idx).to_owned();
                    self.current_frame_mut().ip = cached.ip;
                    let module = vm_try!(self, cached, base_frames, self.import_module(&path));
                    self.push(module);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Protocol helpers used by the loop
    // ------------------------------------------------------------------

    /// Identity (`is`): same inline bits or same heap object.
    #[must_use]
    pub fn is_identical(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Inline(ta, sa), Value::Inline(tb, sb)) => ta == tb && sa == sb,
            (Value::Boxed(_, ia), Value::Boxed(_, ib)) => ia == ib,
            _ => false,
        }
    }

    /// Truthiness: `__bool__`, then `__len__`, then true.
    pub fn py_bool(&mut self, v: Value) -> RunResult<bool> {
        if let Some(b) = v.as_bool() {
            return Ok(b);
        }
        if v.is_none() {
            return Ok(false);
        }
        if let Some(i) = v.as_int() {
            return Ok(i != 0);
        }
        if let Some(f) = v.as_float() {
            return Ok(f != 0.0);
        }
        if let Some(slot) = self.magic_of(v.type_of(), MagicSlot::Bool) {
            let r = self.call_value(slot, &[v])?;
            return r
                .as_bool()
                .ok_or_else(|| RunError::type_error("__bool__ should return bool"));
        }
        if let Some(slot) = self.magic_of(v.type_of(), MagicSlot::Len) {
            let r = self.call_value(slot, &[v])?;
            let n = r.as_index().ok_or_else(|| RunError::type_error("__len__ should return int"))?;
            return Ok(n != 0);
        }
        Ok(true)
    }

    /// `len(v)` through the `__len__` slot.
    pub fn py_len(&mut self, v: Value) -> RunResult<i64> {
        let slot = self
            .magic_of(v.type_of(), MagicSlot::Len)
            .ok_or_else(|| RunError::type_error(format!("object of type '{}' has no len()", self.type_name(v.type_of()))))?;
        let r = self.call_value(slot, &[v])?;
        r.as_index().ok_or_else(|| RunError::type_error("__len__ should return int"))
    }

    /// `iter(v)` through the `__iter__` slot.
    pub fn py_iter(&mut self, v: Value) -> RunResult<Value> {
        let slot = self
            .magic_of(v.type_of(), MagicSlot::Iter)
            .ok_or_else(|| RunError::type_error(format!("'{}' object is not iterable", self.type_name(v.type_of()))))?;
        self.call_value(slot, &[v])
    }

    /// `next(it)`: `Some(value)`, or `None` when the iterator raised
    /// `StopIteration` (which is absorbed here).
    pub fn py_next(&mut self, it: Value) -> RunResult<Option<Value>> {
        let slot = self
            .magic_of(it.type_of(), MagicSlot::Next)
            .ok_or_else(|| RunError::type_error(format!("'{}' object is not an iterator", self.type_name(it.type_of()))))?;
        match self.call_value(slot, &[it]) {
            Ok(v) => Ok(Some(v)),
            Err(err) => {
                if self.is_stop_iteration(&err) {
                    self.is_stopiteration = true;
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn is_stop_iteration(&self, err: &RunError) -> bool {
        match err {
            RunError::Raise(kind, _) => *kind == ExcKind::StopIteration,
            RunError::Value(v) => self
                .types
                .issubclass(v.type_of(), self.types.exc_type(ExcKind::StopIteration)),
        }
    }

    /// `repr(v)` through the `__repr__` slot, with an identity-based
    /// default for plain instances.
    pub fn py_repr(&mut self, v: Value) -> RunResult<String> {
        if let Some(slot) = self.magic_of(v.type_of(), MagicSlot::Repr) {
            let r = self.call_value(slot, &[v])?;
            return self
                .str_of(r)
                .map(str::to_owned)
                .ok_or_else(|| RunError::type_error("__repr__ should return str"));
        }
        Ok(self.default_repr(v))
    }

    /// `str(v)`: `__str__`, falling back to `repr`.
    pub fn py_str(&mut self, v: Value) -> RunResult<String> {
        if let Some(s) = self.str_of(v) {
            return Ok(s.to_owned());
        }
        if let Some(slot) = self.magic_of(v.type_of(), MagicSlot::Str) {
            let r = self.call_value(slot, &[v])?;
            return self
                .str_of(r)
                .map(str::to_owned)
                .ok_or_else(|| RunError::type_error("__str__ should return str"));
        }
        self.py_repr(v)
    }

    pub(crate) fn default_repr(&self, v: Value) -> String {
        let type_name = self.type_name(v.type_of());
        match v.as_obj() {
            Some(id) => format!("<{} object at {:#x}>", type_name, id.index()),
            None => format!("<{type_name}>"),
        }
    }

    /// Object identity as an integer: the heap slot for boxed values, the
    /// raw payload bits for inline ones.
    #[must_use]
    pub fn py_id(&self, v: Value) -> i64 {
        match v {
            Value::Boxed(_, id) => i64::try_from(id.index()).unwrap_or(i64::MAX),
            Value::Inline(t, s) => (i64::from(t.index() as u16) << 48) ^ s.as_int(),
        }
    }

    fn unary_neg(&mut self, v: Value) -> RunResult<Value> {
        if let Some(i) = v.as_int() {
            return i
                .checked_neg()
                .map(Value::new_int)
                .ok_or_else(|| RunError::overflow("integer negation overflow"));
        }
        if let Some(f) = v.as_float() {
            return Ok(Value::new_float(-f));
        }
        match self.magic_of(v.type_of(), MagicSlot::Neg) {
            Some(slot) => self.call_value(slot, &[v]),
            None => Err(RunError::type_error(format!(
                "bad operand type for unary -: '{}'",
                self.type_name(v.type_of())
            ))),
        }
    }

    fn unary_invert(&mut self, v: Value) -> RunResult<Value> {
        if let Some(i) = v.as_index() {
            return Ok(Value::new_int(!i));
        }
        match self.magic_of(v.type_of(), MagicSlot::Invert) {
            Some(slot) => self.call_value(slot, &[v]),
            None => Err(RunError::type_error(format!(
                "bad operand type for unary ~: '{}'",
                self.type_name(v.type_of())
            ))),
        }
    }

    /// Unpacks a list/tuple of exactly `count` items, pushing them so the
    /// first element ends on top.
    fn unpack_sequence(&mut self, seq: Value, count: usize) -> RunResult<()> {
        let items: Vec<Value> = match seq {
            Value::Boxed(_, id) => match self.heap.payload(id) {
                ObjPayload::List(items) => items.clone(),
                ObjPayload::Tuple(items) => items.to_vec(),
                _ => return Err(RunError::type_error("cannot unpack non-sequence")),
            },
            Value::Inline(..) => return Err(RunError::type_error("cannot unpack non-sequence")),
        };
        if items.len() != count {
            return Err(RunError::value_error(format!(
                "expected {count} values to unpack, got {}",
                items.len()
            )));
        }
        for v in items.into_iter().rev() {
            self.push(v);
        }
        Ok(())
    }

    pub(crate) fn set_generator_state(&mut self, gid: HeapId, state: GeneratorState) {
        if let ObjPayload::Generator(slot) = self.heap.payload_mut(gid) {
            **slot = state;
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
