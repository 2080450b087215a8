//! Exception mechanics: materialisation, unwinding, and traceback
//! formatting.
//!
//! Unwinding is block-table driven: the faulting instruction's block chain
//! is walked outward; loops and context managers discard what they own,
//! and a try-except block stops the walk, jumping to its handler with the
//! exception pushed. When a frame runs out of blocks it is popped and the
//! walk continues in the caller.

use crate::{
    error::{ExcKind, RunError, RunResult},
    object::{ExcPayload, ObjPayload, TracebackEntry},
    types::{self, TypeId},
    value::Value,
    vm::Vm,
};

impl Vm {
    /// Allocates an exception instance of a built-in kind.
    pub(crate) fn new_exception(&mut self, kind: ExcKind, msg: Option<String>) -> Value {
        let tid = self.types.exc_type(kind);
        debug_assert_ne!(tid, types::TP_NIL, "exception kind not registered");
        self.new_exception_of(tid, msg)
    }

    fn new_exception_of(&mut self, tid: TypeId, msg: Option<String>) -> Value {
        let id = self.heap.alloc(
            tid,
            ObjPayload::Exception(ExcPayload {
                msg: msg.map(String::into_boxed_str),
                arg: Value::NIL,
                traceback: Vec::new(),
            }),
        );
        Value::Boxed(tid, id)
    }

    /// True if the value's type derives from `BaseException`.
    #[must_use]
    pub(crate) fn is_exception_value(&self, v: Value) -> bool {
        self.types
            .issubclass(v.type_of(), self.types.exc_type(ExcKind::BaseException))
    }

    /// Converts the operand of a `Raise` opcode into a pending error:
    /// exception instances raise as-is, exception classes are
    /// instantiated with no arguments.
    pub(crate) fn raise_value(&mut self, v: Value) -> RunResult<RunError> {
        if self.is_exception_value(v) {
            return Ok(RunError::Value(v));
        }
        if let Some(tid) = self.as_type_id(v) {
            if self.types.issubclass(tid, self.types.exc_type(ExcKind::BaseException)) {
                let exc = self.new_exception_of(tid, None);
                return Ok(RunError::Value(exc));
            }
            return Err(RunError::type_error("exceptions must derive from BaseException"));
        }
        Err(RunError::type_error("exceptions must derive from BaseException"))
    }

    /// Bare `raise`: the current exception, still pending or caught but
    /// not yet cleared.
    pub(crate) fn reraise_error(&mut self) -> RunResult<RunError> {
        match self.curr_exception {
            Some(exc) => {
                self.is_curr_exc_handled = false;
                Ok(RunError::Value(exc))
            }
            None => Err(RunError::runtime_error("no active exception to reraise")),
        }
    }

    /// `except` clause matching: class or tuple of classes.
    pub(crate) fn exc_matches(&mut self, exc: Value, cls: Value) -> RunResult<bool> {
        if self.as_type_id(cls).is_none() {
            // allow tuples; reject everything else
            let is_tuple = cls.type_of() == types::TP_TUPLE;
            if !is_tuple {
                return Err(RunError::type_error(
                    "catching classes that do not inherit from BaseException is not allowed",
                ));
            }
        }
        self.py_isinstance(exc, cls)
    }

    /// Explicitly resets the pending-exception state.
    pub fn clear_exc(&mut self) {
        self.curr_exception = None;
        self.is_curr_exc_handled = false;
    }

    /// The pending (or caught-but-uncleared) exception, if any.
    #[must_use]
    pub fn current_exception(&self) -> Option<Value> {
        self.curr_exception
    }

    /// True when the pending exception has been caught by a handler but
    /// not yet cleared.
    #[must_use]
    pub fn is_exc_handled(&self) -> bool {
        self.is_curr_exc_handled
    }

    /// Turns a native-layer error into an exception value, recording the
    /// innermost traceback frame.
    fn materialize_exception(&mut self, err: RunError) -> Value {
        let exc = match err {
            RunError::Value(v) => v,
            RunError::Raise(kind, msg) => self.new_exception(kind, msg),
        };
        if let Some(frame) = self.frames.last() {
            let entry = TracebackEntry {
                func: frame.code.name.clone().into_boxed_str(),
                line: frame.current_line(),
            };
            self.append_traceback(exc, entry);
        }
        exc
    }

    fn append_traceback(&mut self, exc: Value, entry: TracebackEntry) {
        if let Some(id) = exc.as_obj()
            && let ObjPayload::Exception(payload) = self.heap.payload_mut(id)
        {
            payload.traceback.push(entry);
        }
    }

    /// Unwinds the pending error through the block tables of the active
    /// frames. Returns `Ok(())` with the top frame positioned at a handler
    /// (exception pushed), or propagates the error once `base_frames` is
    /// reached.
    pub(crate) fn unwind(&mut self, err: RunError, base_frames: usize) -> RunResult<()> {
        let exc = self.materialize_exception(err);
        self.curr_exception = Some(exc);
        self.is_curr_exc_handled = false;

        loop {
            let handler = {
                let frame = self.frames.last().expect("unwinding without a frame");
                let faulting_ip = frame.ip.saturating_sub(1);
                frame.prepare_jump_exception_handler(&mut self.stack, faulting_ip)
            };
            if let Some(target) = handler {
                self.frames.last_mut().expect("unwinding without a frame").ip = target;
                self.push(exc);
                self.is_curr_exc_handled = true;
                return Ok(());
            }

            let frame = self.frames.pop().expect("unwinding without a frame");
            self.stack.truncate(frame.p0);
            if let Some(gid) = frame.gen_slot {
                self.set_generator_state(gid, crate::object::GeneratorState::Done);
            }
            if self.frames.len() == base_frames {
                return Err(RunError::Value(exc));
            }
            // record the caller now propagating the exception
            let caller = self.frames.last().expect("frame stack underflow during unwinding");
            let entry = TracebackEntry {
                func: caller.code.name.clone().into_boxed_str(),
                line: caller.current_line(),
            };
            self.append_traceback(exc, entry);
        }
    }

    /// Formats an uncaught exception the way the standalone interpreter
    /// prints it: traceback (most recent call last), then `Kind: message`.
    pub fn format_exc(&mut self, exc: Value) -> String {
        let mut out = String::new();
        let (traceback, header) = self.exception_parts(exc);
        if !traceback.is_empty() {
            out.push_str("Traceback (most recent call last):\n");
            for entry in traceback.iter().rev() {
                out.push_str(&format!("  File \"<source>\", line {}, in {}\n", entry.line, entry.func));
            }
        }
        out.push_str(&header);
        out.push('\n');
        out
    }

    fn exception_parts(&mut self, exc: Value) -> (Vec<TracebackEntry>, String) {
        let type_name = self.type_name(exc.type_of()).to_owned();
        match exc.as_obj().map(|id| self.heap.payload(id)) {
            Some(ObjPayload::Exception(payload)) => {
                let traceback = payload.traceback.clone();
                let header = match &payload.msg {
                    Some(msg) => format!("{type_name}: {msg}"),
                    None => type_name,
                };
                (traceback, header)
            }
            _ => (Vec::new(), type_name),
        }
    }

    /// Message text of an exception value (for `str(e)` and hosts).
    #[must_use]
    pub fn exception_message(&self, exc: Value) -> String {
        match exc.as_obj().map(|id| self.heap.payload(id)) {
            Some(ObjPayload::Exception(payload)) => payload.msg.as_deref().unwrap_or("").to_owned(),
            _ => String::new(),
        }
    }

    /// The registered exception kind of a raised value, when it is one of
    /// the built-in kinds (subclasses report their nearest builtin base).
    #[must_use]
    pub fn exception_kind(&self, exc: Value) -> Option<ExcKind> {
        let mut t = exc.type_of();
        loop {
            if let Some(kind) = self.types.exc_kind_of(t) {
                return Some(kind);
            }
            let base = self.types.get(t).base;
            if base == types::TP_NIL {
                return None;
            }
            t = base;
        }
    }
}
