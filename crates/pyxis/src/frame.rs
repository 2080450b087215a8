//! Activation records.
//!
//! A frame owns its locals array and a window of the shared operand stack
//! starting at `p0`. Structured-control exits (exception unwinding, `break`,
//! `continue`) are driven by the code object's block table: each block kind
//! knows what it left on the operand stack and how to discard it.

use std::sync::Arc;

use crate::{
    bytecode::code::{BlockKind, Code},
    intern::Name,
    value::{HeapId, Value},
};

/// One activation of a code object.
#[derive(Debug)]
pub struct Frame {
    pub code: Arc<Code>,
    /// Enclosing module object, consulted for global lookups.
    pub module: Value,
    /// The callable being executed (NIL for module-level frames). Closure
    /// lookups read through it.
    pub callable: Value,
    /// Local slots; unassigned slots hold the NIL sentinel.
    pub locals: Box<[Value]>,
    /// Operand-stack base within the shared value stack. The frame may not
    /// pop below this watermark.
    pub p0: usize,
    /// Instruction pointer into `code.bytecode()`.
    pub ip: usize,
    /// The code object's name pool, interned into the executing VM.
    pub names: Box<[Name]>,
    /// For `__init__` frames: the instance to produce when the frame
    /// returns (constructor calls discard `__init__`'s own return value).
    pub init_instance: Value,
    /// For generator frames: the generator object this frame belongs to.
    pub gen_slot: Option<HeapId>,
}

impl Frame {
    pub fn new(code: Arc<Code>, module: Value, callable: Value, p0: usize, names: Box<[Name]>) -> Self {
        let locals = vec![Value::NIL; code.nlocals()].into_boxed_slice();
        Self {
            code,
            module,
            callable,
            locals,
            p0,
            ip: 0,
            names,
            init_instance: Value::NIL,
            gen_slot: None,
        }
    }

    /// Exits one structured block during unwinding, discarding whatever it
    /// owns on the operand stack. Returns the parent block index.
    ///
    /// - for/while loops drop partial expression state and the iterator;
    /// - context managers drop the context value (`__exit__` is invoked by
    ///   the dedicated opcode on normal exit, never here);
    /// - try blocks own nothing.
    pub fn exit_block(&self, stack: &mut Vec<Value>, i: i16) -> i16 {
        let block = *self.code.block(i);
        let base = self.p0 + usize::from(block.stack_depth);
        stack.truncate(base);
        match block.kind {
            BlockKind::ForLoop => {
                // the recorded depth includes the iterator
                stack.pop();
            }
            BlockKind::ContextManager => {
                // the recorded depth includes the context value
                stack.pop();
            }
            BlockKind::While | BlockKind::TryExcept => {}
        }
        block.parent
    }

    /// Walks blocks outward from the instruction at `ip` looking for a
    /// try-except handler, exiting every intermediate block. On success the
    /// operand stack has been truncated to the try block's entry depth and
    /// the handler's bytecode offset is returned; the caller pushes the
    /// exception value. `None` means this frame has no handler and should
    /// be popped.
    pub fn prepare_jump_exception_handler(&self, stack: &mut Vec<Value>, ip: usize) -> Option<usize> {
        let mut i = self.code.block_at(ip);
        while i >= 0 {
            let block = self.code.block(i);
            if block.kind == BlockKind::TryExcept {
                stack.truncate(self.p0 + usize::from(block.stack_depth));
                return Some(block.end as usize);
            }
            i = self.exit_block(stack, i);
        }
        // no handler: discard this frame's whole operand window
        stack.truncate(self.p0);
        None
    }

    /// Exits the blocks between the instruction at `ip` and the jump
    /// `target` (`break`/`continue` cleanup). The jump itself is the
    /// caller's job.
    pub fn prepare_jump_break(&self, stack: &mut Vec<Value>, ip: usize, target: usize) {
        let target_block = self.code.block_at(target);
        let mut i = self.code.block_at(ip);
        while i >= 0 && i != target_block {
            i = self.exit_block(stack, i);
        }
    }

    /// Marks this frame's owned values (locals, module, callable). The
    /// operand-stack window is marked by the VM, which owns the stack.
    pub fn trace(&self, mark: &mut dyn FnMut(Value)) {
        for &v in &self.locals {
            mark(v);
        }
        mark(self.module);
        mark(self.callable);
        mark(self.init_instance);
    }

    /// Source line of the current instruction.
    #[must_use]
    pub fn current_line(&self) -> u32 {
        self.code.line_of(self.ip.saturating_sub(1))
    }
}
