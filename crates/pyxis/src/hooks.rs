//! Host callbacks and the compiler boundary.
//!
//! The runtime consumes code objects; lowering source text to them is the
//! host's job, installed as a [`Compiler`]. The remaining hooks cover the
//! platform edges: stdout, stdin, and import file loading. Everything is
//! set once at VM construction.

use std::io::Write;

use crate::{bytecode::code::Code, bytecode::op::Opcode, error::RunResult, value::Value};

/// How a source string should be lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// A module body of statements.
    Exec,
    /// A single expression; the code object returns its value.
    Eval,
    /// A single interactive statement (echoes expression results).
    Single,
    /// JSON-literal expressions only.
    Json,
    /// Interactive input; may report [`CompileError::NeedMoreLines`].
    Repl,
    /// Re-execution of an existing module body.
    Reload,
}

/// Compiler-side failures.
#[derive(Debug)]
pub enum CompileError {
    /// Syntax error with a message for the host.
    Syntax(String),
    /// REPL mode only: the input is incomplete, feed more lines.
    NeedMoreLines,
    /// No compiler hook is installed.
    NoCompiler,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax(msg) => write!(f, "SyntaxError: {msg}"),
            Self::NeedMoreLines => write!(f, "need more lines"),
            Self::NoCompiler => write!(f, "no compiler installed"),
        }
    }
}

/// The external compiler: source text in, code object out.
pub trait Compiler {
    fn compile(&mut self, source: &str, mode: CompileMode, filename: &str) -> Result<Code, CompileError>;
}

/// Pre-opcode trap context passed to `ceval_on_step`.
#[derive(Debug, Clone, Copy)]
pub struct StepInfo {
    /// Bytecode offset of the opcode about to execute.
    pub ip: usize,
    pub opcode: Opcode,
    /// Current call-stack depth.
    pub frame_depth: usize,
}

/// A module value produced by the lazy-import hook, or `None` to fall
/// through to `importfile`.
pub type LazyImportFn = fn(name: &str) -> Option<Value>;

/// Host callbacks, fixed at VM construction.
pub struct Hooks {
    /// stdout sink for `print` and error output.
    pub print: Box<dyn FnMut(&str)>,
    /// Flush the stdout sink.
    pub flush: Box<dyn FnMut()>,
    /// One byte of stdin, or negative on EOF, for `input()`.
    pub getchr: Box<dyn FnMut() -> i32>,
    /// Returns the source text of an import filename, or `None` when not
    /// found. The filename uses the platform path separator.
    pub importfile: Box<dyn FnMut(&str) -> Option<String>>,
    /// Optional lazy-import shortcut consulted before `importfile`.
    pub lazyimport: Option<LazyImportFn>,
    /// Pre-opcode trap; may raise to interrupt execution cooperatively.
    pub ceval_on_step: Option<Box<dyn FnMut(&StepInfo) -> RunResult<()>>>,
}

impl Hooks {
    /// Stdout/EOF defaults, the standalone-interpreter configuration.
    #[must_use]
    pub fn stdio() -> Self {
        Self {
            print: Box::new(|s| {
                let mut out = std::io::stdout();
                let _ = out.write_all(s.as_bytes());
            }),
            flush: Box::new(|| {
                let _ = std::io::stdout().flush();
            }),
            getchr: Box::new(|| {
                use std::io::Read;
                let mut byte = [0u8; 1];
                match std::io::stdin().read(&mut byte) {
                    Ok(1) => i32::from(byte[0]),
                    _ => -1,
                }
            }),
            importfile: Box::new(|_| None),
            lazyimport: None,
            ceval_on_step: None,
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::stdio()
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("lazyimport", &self.lazyimport.is_some())
            .field("ceval_on_step", &self.ceval_on_step.is_some())
            .finish_non_exhaustive()
    }
}
