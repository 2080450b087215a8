#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked at the call sites")]

pub mod bytecode;
mod builtins;
mod compute;
mod error;
mod frame;
mod heap;
mod hooks;
mod intern;
mod modules;
mod object;
mod pickle;
pub mod types;
mod value;
mod vm;

pub use crate::{
    compute::{ComputeThread, MAX_VM_SLOTS},
    error::{ExcKind, RunError, RunResult},
    heap::{GC_MIN_THRESHOLD, HeapStats, SMALL_CELL_SIZE},
    hooks::{CompileError, CompileMode, Compiler, Hooks, StepInfo},
    intern::Name,
    modules::ModuleRegistry,
    pickle::{PickleNode, PickleRegistry},
    value::{HeapId, Scalar, Value},
    vm::{DEFAULT_RECURSION_LIMIT, MAX_CO_VARNAMES, STACK_SIZE, Vm},
};
