//! Builder for emitting bytecode.
//!
//! `CodeBuilder` encodes opcodes and operands into raw bytes, patches
//! forward jumps, tracks operand-stack depth, and maintains the line and
//! block tables as instructions are emitted. The external compiler drives
//! it to lower source; tests drive it directly to hand-assemble code
//! objects.

use std::sync::Arc;

use super::{
    code::{BlockKind, Code, CodeBlock, Constant, FuncDecl, LineEntry},
    op::Opcode,
};

/// Label for a forward jump awaiting `patch_jump`.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

/// Handle to an open block (see [`CodeBuilder::enter_block`]).
#[derive(Debug, Clone, Copy)]
pub struct BlockId(usize);

/// Builder for emitting bytecode.
///
/// # Usage
///
/// ```
/// use pyxis::bytecode::{CodeBuilder, Opcode};
///
/// let mut b = CodeBuilder::new("<module>");
/// let k = b.add_const_int(41);
/// b.emit_u16(Opcode::LoadConst, k);
/// b.emit_i8(Opcode::LoadSmallInt, 1);
/// b.emit(Opcode::BinaryAdd);
/// b.emit(Opcode::ReturnValue);
/// let code = b.build();
/// assert_eq!(code.max_stack_depth(), 2);
/// ```
#[derive(Debug)]
pub struct CodeBuilder {
    name: String,
    bytecode: Vec<u8>,
    consts: Vec<Constant>,
    names: Vec<String>,
    varnames: Vec<String>,
    lines: Vec<LineEntry>,
    blocks: Vec<CodeBlock>,
    functions: Vec<Arc<FuncDecl>>,
    /// Innermost open block, or -1.
    current_block: i16,
    current_line: u32,
    current_stack_depth: u16,
    max_stack_depth: u16,
}

impl CodeBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            bytecode: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            lines: Vec::new(),
            blocks: Vec::new(),
            functions: Vec::new(),
            current_block: -1,
            current_line: 0,
            current_stack_depth: 0,
            max_stack_depth: 0,
        }
    }

    /// Sets the source line recorded for subsequent instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Emits a no-operand instruction.
    pub fn emit(&mut self, op: Opcode) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u8 operand.
    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand);
        self.track_stack_effect_u8(op, operand);
    }

    /// Emits an instruction with an i8 operand.
    pub fn emit_i8(&mut self, op: Opcode, operand: i8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand.to_ne_bytes()[0]);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u16 operand (little-endian).
    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
        self.track_stack_effect_u16(op, operand);
    }

    /// Emits `Call argc kwargc`.
    pub fn emit_call(&mut self, argc: u8, kwargc: u8) {
        self.start_instruction();
        self.bytecode.push(Opcode::Call as u8);
        self.bytecode.push(argc);
        self.bytecode.push(kwargc);
        // pops callable + argc + 2*kwargc, pushes result
        self.adjust_stack(-(i16::from(argc) + 2 * i16::from(kwargc)));
    }

    /// Emits `MakeFunction decl_idx defaults_count`.
    pub fn emit_make_function(&mut self, decl_idx: u16, defaults_count: u8) {
        self.start_instruction();
        self.bytecode.push(Opcode::MakeFunction as u8);
        self.bytecode.extend_from_slice(&decl_idx.to_le_bytes());
        self.bytecode.push(defaults_count);
        // pops the defaults, pushes the function
        self.adjust_stack(1 - i16::from(defaults_count));
    }

    /// Emits `BuildClass name_idx has_base`.
    pub fn emit_build_class(&mut self, name_idx: u16, has_base: bool) {
        self.start_instruction();
        self.bytecode.push(Opcode::BuildClass as u8);
        self.bytecode.extend_from_slice(&name_idx.to_le_bytes());
        self.bytecode.push(u8::from(has_base));
        // pops methods dict (+ base), pushes the type
        self.adjust_stack(-i16::from(has_base));
    }

    /// Emits a forward jump, returning a label to patch once the target is
    /// known.
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        self.start_instruction();
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&0i16.to_le_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
        label
    }

    /// Patches a forward jump to the current offset.
    ///
    /// # Panics
    ///
    /// Panics if the offset exceeds `i16`, which means the function body is
    /// too large for the encoding.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.bytecode.len();
        let raw = i64::try_from(target).expect("offset exceeds i64") - i64::try_from(label.0).expect("label exceeds i64") - 3;
        let offset = i16::try_from(raw).expect("jump offset exceeds i16; function too large");
        let bytes = offset.to_le_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
    }

    /// Emits a backward jump to a known offset.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        self.start_instruction();
        let current = self.bytecode.len();
        let raw = i64::try_from(target).expect("target exceeds i64") - i64::try_from(current + 3).expect("offset exceeds i64");
        let offset = i16::try_from(raw).expect("jump offset exceeds i16; function too large");
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&offset.to_le_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Current bytecode offset (records loop heads for backward jumps).
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Opens a structured block at the current offset. The recorded stack
    /// depth is the depth right now: for `for` loops, enter the block
    /// after `GetIter` so the iterator is inside it.
    pub fn enter_block(&mut self, kind: BlockKind) -> BlockId {
        let id = self.blocks.len();
        self.blocks.push(CodeBlock {
            kind,
            start: u32::try_from(self.current_offset()).expect("offset exceeds u32"),
            end: 0,
            parent: self.current_block,
            stack_depth: self.current_stack_depth,
        });
        self.current_block = i16::try_from(id).expect("block table exceeds i16");
        BlockId(id)
    }

    /// Closes the innermost block, recording the current offset as its end.
    pub fn exit_block(&mut self) {
        let id = usize::try_from(self.current_block).expect("exit_block with no open block");
        self.blocks[id].end = u32::try_from(self.current_offset()).expect("offset exceeds u32");
        self.current_block = self.blocks[id].parent;
    }

    /// Overrides a block's end offset. Try blocks point `end` at their
    /// handler, which is emitted after the block is closed.
    pub fn set_block_end(&mut self, block: BlockId, offset: usize) {
        self.blocks[block.0].end = u32::try_from(offset).expect("offset exceeds u32");
    }

    /// Adds a constant, returning its pool index.
    #[must_use]
    pub fn add_const(&mut self, c: Constant) -> u16 {
        let idx = u16::try_from(self.consts.len()).expect("constant pool exceeds u16");
        self.consts.push(c);
        idx
    }

    #[must_use]
    pub fn add_const_int(&mut self, v: i64) -> u16 {
        self.add_const(Constant::Int(v))
    }

    #[must_use]
    pub fn add_const_float(&mut self, v: f64) -> u16 {
        self.add_const(Constant::Float(v))
    }

    #[must_use]
    pub fn add_const_str(&mut self, s: &str) -> u16 {
        self.add_const(Constant::Str(s.to_owned()))
    }

    /// Adds (or reuses) a name-pool entry.
    #[must_use]
    pub fn add_name(&mut self, name: &str) -> u16 {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return u16::try_from(idx).expect("name pool exceeds u16");
        }
        let idx = u16::try_from(self.names.len()).expect("name pool exceeds u16");
        self.names.push(name.to_owned());
        idx
    }

    /// Adds (or reuses) a local slot for `name`, returning the slot index.
    #[must_use]
    pub fn add_varname(&mut self, name: &str) -> u8 {
        if let Some(idx) = self.varnames.iter().position(|n| n == name) {
            return u8::try_from(idx).expect("varname table exceeds u8");
        }
        let idx = u8::try_from(self.varnames.len()).expect("varname table exceeds u8");
        self.varnames.push(name.to_owned());
        idx
    }

    /// Registers a nested function declaration.
    #[must_use]
    pub fn add_function(&mut self, decl: FuncDecl) -> u16 {
        let idx = u16::try_from(self.functions.len()).expect("function table exceeds u16");
        self.functions.push(Arc::new(decl));
        idx
    }

    /// Current tracked stack depth.
    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        self.current_stack_depth
    }

    /// Manual stack adjustment for shapes the builder cannot infer (e.g.
    /// the exception pushed on handler entry).
    pub fn adjust_stack_depth(&mut self, delta: i16) {
        self.adjust_stack(delta);
    }

    /// Builds the final code object.
    #[must_use]
    pub fn build(self) -> Code {
        debug_assert_eq!(self.current_block, -1, "unclosed block at build time");
        Code::new(
            self.name,
            self.bytecode,
            self.consts,
            self.names,
            self.varnames,
            self.lines,
            self.blocks,
            self.functions,
            self.max_stack_depth,
        )
    }

    /// Records the line-table entry for the instruction about to be
    /// emitted.
    fn start_instruction(&mut self) {
        self.lines.push(LineEntry {
            offset: u32::try_from(self.bytecode.len()).expect("bytecode exceeds u32"),
            line: self.current_line,
            block: self.current_block,
        });
    }

    fn adjust_stack(&mut self, delta: i16) {
        let new_depth = i32::from(self.current_stack_depth) + i32::from(delta);
        debug_assert!(new_depth >= 0, "stack depth went negative: {new_depth}");
        self.current_stack_depth = u16::try_from(new_depth.max(0)).unwrap_or(u16::MAX);
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);
    }

    fn track_stack_effect_u8(&mut self, op: Opcode, operand: u8) {
        let effect: i16 = match op {
            // pops the sequence, pushes n items
            Opcode::UnpackSequence => i16::from(operand) - 1,
            // pops 2 or 3 bounds, pushes the slice
            Opcode::BuildSlice => 1 - i16::from(operand),
            _ => op.stack_effect().unwrap_or(0),
        };
        self.adjust_stack(effect);
    }

    fn track_stack_effect_u16(&mut self, op: Opcode, operand: u16) {
        let operand_i16 = operand.cast_signed();
        let effect: i16 = match op {
            Opcode::BuildList | Opcode::BuildTuple => 1 - operand_i16,
            Opcode::BuildDict => 1 - 2 * operand_i16,
            _ => op.stack_effect().unwrap_or(0),
        };
        self.adjust_stack(effect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_basic() {
        let mut b = CodeBuilder::new("<test>");
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::Pop);
        let code = b.build();
        assert_eq!(code.bytecode(), &[Opcode::LoadNone as u8, Opcode::Pop as u8]);
        assert_eq!(code.max_stack_depth(), 1);
    }

    #[test]
    fn test_forward_jump() {
        let mut b = CodeBuilder::new("<test>");
        let jump = b.emit_jump(Opcode::Jump);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::LoadNone);
        b.patch_jump(jump);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
        let code = b.build();
        // Jump at 0, operand ends at 3, target 5 -> offset 2
        assert_eq!(code.bytecode()[0], Opcode::Jump as u8);
        assert_eq!(i16::from_le_bytes([code.bytecode()[1], code.bytecode()[2]]), 2);
    }

    #[test]
    fn test_backward_jump() {
        let mut b = CodeBuilder::new("<test>");
        let start = b.current_offset();
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::Pop);
        b.emit_jump_to(Opcode::Jump, start);
        let code = b.build();
        let n = code.bytecode().len();
        assert_eq!(i16::from_le_bytes([code.bytecode()[n - 2], code.bytecode()[n - 1]]), -5);
    }

    #[test]
    fn test_block_table_and_lines() {
        let mut b = CodeBuilder::new("<test>");
        b.set_line(1);
        b.emit(Opcode::LoadNone); // offset 0, no block
        b.emit(Opcode::GetIter);
        let _block = b.enter_block(BlockKind::ForLoop);
        b.set_line(2);
        b.emit(Opcode::Nop); // offset 2, inside block 0
        b.exit_block();
        b.emit(Opcode::Pop);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
        let code = b.build();
        assert_eq!(code.block_at(0), -1);
        assert_eq!(code.block_at(2), 0);
        assert_eq!(code.line_of(2), 2);
        assert_eq!(code.blocks()[0].kind, BlockKind::ForLoop);
        // iterator was on the stack when the block opened
        assert_eq!(code.blocks()[0].stack_depth, 1);
    }

    #[test]
    fn test_call_stack_effect() {
        let mut b = CodeBuilder::new("<test>");
        b.emit(Opcode::LoadNone); // callable
        b.emit(Opcode::LoadNone); // arg
        b.emit(Opcode::LoadNone); // key
        b.emit(Opcode::LoadNone); // value
        b.emit_call(1, 1);
        assert_eq!(b.stack_depth(), 1);
        let code = b.build();
        assert_eq!(code.max_stack_depth(), 4);
    }
}
