//! Code objects: immutable compiled units.
//!
//! A [`Code`] owns its bytecode, constant pool, name pools, line table and
//! block table. Constants are self-contained (no heap handles), which keeps
//! code objects `Send` and serializable, so they cross VM slots and the CLI's
//! artifact format as postcard bytes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A constant-pool entry. Materialised into a `Value` by `LoadConst`
/// (strings allocate on the executing VM's heap).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Structured-control region kinds tracked by the block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    ForLoop,
    While,
    TryExcept,
    ContextManager,
}

/// One structured-control region. `start`/`end` are bytecode offsets; for
/// `TryExcept` blocks `end` is the handler entry point. `stack_depth` is
/// the operand-stack depth (relative to the frame base) on entry, used to
/// discard partial expression state when the block exits abnormally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CodeBlock {
    pub kind: BlockKind,
    pub start: u32,
    pub end: u32,
    /// Enclosing block index, or -1.
    pub parent: i16,
    pub stack_depth: u16,
}

/// Line-table entry: maps the instruction at `offset` to its source line
/// and enclosing block. Entries are sorted by offset and binary-searched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
    /// Block-table index, or -1 outside any block.
    pub block: i16,
}

/// A function's parameter specification.
///
/// Locals layout contract: slots `0..args.len()` hold the positional-or-
/// keyword parameters, followed by the `*args` slot (if any), the
/// keyword-only parameters, and the `**kwargs` slot (if any). The code
/// object's varname table lists them in exactly this order, before any
/// plain locals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Positional-or-keyword parameter names.
    pub args: Vec<String>,
    /// How many of `args` (from the end) have defaults.
    pub arg_defaults_count: usize,
    /// `*args` parameter name.
    pub var_args: Option<String>,
    /// Keyword-only parameter names.
    pub kwonly: Vec<String>,
    /// Per keyword-only parameter: index into the defaults array (after
    /// the positional defaults), or `None` when the parameter is required.
    pub kwonly_default_map: Vec<Option<usize>>,
    /// `**kwargs` parameter name.
    pub var_kwargs: Option<String>,
}

impl ParamSpec {
    /// A spec of simple positional parameters with no defaults.
    #[must_use]
    pub fn positional(names: &[&str]) -> Self {
        Self {
            args: names.iter().map(|&s| s.to_owned()).collect(),
            ..Self::default()
        }
    }

    /// Number of local slots occupied by parameters.
    #[must_use]
    pub fn param_slot_count(&self) -> usize {
        self.args.len()
            + usize::from(self.var_args.is_some())
            + self.kwonly.len()
            + usize::from(self.var_kwargs.is_some())
    }

    /// Local slot of the `*args` tuple, when present.
    #[must_use]
    pub fn var_args_slot(&self) -> Option<usize> {
        self.var_args.as_ref().map(|_| self.args.len())
    }

    /// Local slot of the i-th keyword-only parameter.
    #[must_use]
    pub fn kwonly_slot(&self, i: usize) -> usize {
        self.args.len() + usize::from(self.var_args.is_some()) + i
    }

    /// Local slot of the `**kwargs` dict, when present.
    #[must_use]
    pub fn var_kwargs_slot(&self) -> Option<usize> {
        self.var_kwargs
            .as_ref()
            .map(|_| self.args.len() + usize::from(self.var_args.is_some()) + self.kwonly.len())
    }
}

/// A nested function declaration: the parameter spec plus the compiled
/// body. Default values are evaluated at `def` time by `MakeFunction` and
/// stored on the function object, not here.
#[derive(Debug, Serialize, Deserialize)]
pub struct FuncDecl {
    pub name: String,
    pub params: ParamSpec,
    pub is_generator: bool,
    pub code: Arc<Code>,
}

/// An immutable compiled unit.
#[derive(Debug, Serialize, Deserialize)]
pub struct Code {
    /// Display name (`<module>`, function name, …).
    pub name: String,
    bytecode: Vec<u8>,
    consts: Vec<Constant>,
    /// Attribute / global / keyword names referenced by u16 operands.
    names: Vec<String>,
    /// Local variable names, indexed by slot.
    varnames: Vec<String>,
    lines: Vec<LineEntry>,
    blocks: Vec<CodeBlock>,
    /// Nested function declarations, referenced by `MakeFunction`.
    functions: Vec<Arc<FuncDecl>>,
    max_stack_depth: u16,
}

impl Code {
    #[expect(clippy::too_many_arguments, reason = "built once, by the builder")]
    pub(crate) fn new(
        name: String,
        bytecode: Vec<u8>,
        consts: Vec<Constant>,
        names: Vec<String>,
        varnames: Vec<String>,
        lines: Vec<LineEntry>,
        blocks: Vec<CodeBlock>,
        functions: Vec<Arc<FuncDecl>>,
        max_stack_depth: u16,
    ) -> Self {
        Self {
            name,
            bytecode,
            consts,
            names,
            varnames,
            lines,
            blocks,
            functions,
            max_stack_depth,
        }
    }

    #[inline]
    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[inline]
    #[must_use]
    pub fn const_at(&self, idx: u16) -> &Constant {
        &self.consts[usize::from(idx)]
    }

    #[inline]
    #[must_use]
    pub fn name_at(&self, idx: u16) -> &str {
        &self.names[usize::from(idx)]
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn varnames(&self) -> &[String] {
        &self.varnames
    }

    /// Number of local slots.
    #[must_use]
    pub fn nlocals(&self) -> usize {
        self.varnames.len()
    }

    #[must_use]
    pub fn decl_at(&self, idx: u16) -> &Arc<FuncDecl> {
        &self.functions[usize::from(idx)]
    }

    #[must_use]
    pub fn blocks(&self) -> &[CodeBlock] {
        &self.blocks
    }

    #[must_use]
    pub fn block(&self, idx: i16) -> &CodeBlock {
        &self.blocks[usize::try_from(idx).expect("negative block index")]
    }

    #[must_use]
    pub fn max_stack_depth(&self) -> u16 {
        self.max_stack_depth
    }

    /// The line-table entry covering the instruction at `ip`.
    fn line_entry_at(&self, ip: usize) -> Option<&LineEntry> {
        let offset = u32::try_from(ip).expect("ip exceeds u32");
        let idx = self.lines.partition_point(|e| e.offset <= offset);
        if idx == 0 { None } else { Some(&self.lines[idx - 1]) }
    }

    /// Source line of the instruction at `ip` (0 when unknown).
    #[must_use]
    pub fn line_of(&self, ip: usize) -> u32 {
        self.line_entry_at(ip).map_or(0, |e| e.line)
    }

    /// Block-table index of the innermost block containing `ip`, or -1.
    #[must_use]
    pub fn block_at(&self, ip: usize) -> i16 {
        self.line_entry_at(ip).map_or(-1, |e| e.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_slot_layout() {
        let spec = ParamSpec {
            args: vec!["a".into(), "b".into()],
            arg_defaults_count: 1,
            var_args: Some("c".into()),
            kwonly: vec!["k".into()],
            kwonly_default_map: vec![None],
            var_kwargs: Some("d".into()),
        };
        assert_eq!(spec.param_slot_count(), 5);
        assert_eq!(spec.var_args_slot(), Some(2));
        assert_eq!(spec.kwonly_slot(0), 3);
        assert_eq!(spec.var_kwargs_slot(), Some(4));
    }
}
