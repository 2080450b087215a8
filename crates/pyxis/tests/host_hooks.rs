//! Host-callback behavior: print capture, input, the per-step trap, and
//! the compiler boundary.

use std::{
    cell::RefCell,
    rc::Rc,
    sync::atomic::{AtomicUsize, Ordering},
};

use pretty_assertions::assert_eq;
use pyxis::{
    CompileError, CompileMode, Compiler, ExcKind, Hooks, RunError, Value, Vm,
    bytecode::{Code, CodeBuilder, Opcode},
};

fn capture_hooks() -> (Hooks, Rc<RefCell<String>>) {
    let buffer = Rc::new(RefCell::new(String::new()));
    let sink = buffer.clone();
    let hooks = Hooks {
        print: Box::new(move |s| sink.borrow_mut().push_str(s)),
        ..Hooks::stdio()
    };
    (hooks, buffer)
}

#[test]
fn test_print_goes_through_the_host_sink() {
    let (hooks, buffer) = capture_hooks();
    let mut vm = Vm::with_hooks(hooks);

    let print = vm.get_builtin("print").unwrap();
    let a = vm.new_str("hello");
    let b = vm.new_str("world");
    vm.call_value(print, &[a, b]).unwrap();
    assert_eq!(buffer.borrow().as_str(), "hello world\n");
}

#[test]
fn test_print_applies_str_conversion() {
    let (hooks, buffer) = capture_hooks();
    let mut vm = Vm::with_hooks(hooks);
    let print = vm.get_builtin("print").unwrap();
    let items = vm.new_list(vec![Value::new_int(1), Value::new_int(2)]);
    vm.call_value(print, &[Value::new_int(7), items]).unwrap();
    assert_eq!(buffer.borrow().as_str(), "7 [1, 2]\n");
}

#[test]
fn test_input_reads_until_newline() {
    let script = b"abc\nrest".to_vec();
    let cursor = Rc::new(AtomicUsize::new(0));
    let src = cursor.clone();
    let hooks = Hooks {
        getchr: Box::new(move || {
            let i = src.fetch_add(1, Ordering::Relaxed);
            script.get(i).map_or(-1, |&b| i32::from(b))
        }),
        ..Hooks::stdio()
    };
    let mut vm = Vm::with_hooks(hooks);
    let input = vm.get_builtin("input").unwrap();
    let line = vm.call_value(input, &[]).unwrap();
    assert_eq!(vm.str_of(line), Some("abc"));
}

#[test]
fn test_step_hook_can_interrupt_execution() {
    let hooks = Hooks {
        ceval_on_step: Some(Box::new(|info| {
            if info.ip >= 4 {
                Err(RunError::Raise(ExcKind::RuntimeError, Some("interrupted".to_owned())))
            } else {
                Ok(())
            }
        })),
        ..Hooks::stdio()
    };
    let mut vm = Vm::with_hooks(hooks);

    // an infinite loop the trap must break out of
    let mut b = CodeBuilder::new("<module>");
    let start = b.current_offset();
    b.emit(Opcode::Nop);
    b.emit(Opcode::Nop);
    b.emit(Opcode::Nop);
    b.emit(Opcode::Nop);
    b.emit_jump_to(Opcode::Jump, start);
    let main = vm.main_module();
    let err = vm.exec_code(b.build(), main).unwrap_err();
    let RunError::Value(exc) = err else {
        panic!("expected a materialised exception");
    };
    assert_eq!(vm.exception_kind(exc), Some(ExcKind::RuntimeError));
    assert_eq!(vm.exception_message(exc), "interrupted");
}

/// A canned compiler: ignores the source and returns `x = 42`.
struct CannedCompiler;

impl Compiler for CannedCompiler {
    fn compile(&mut self, source: &str, mode: CompileMode, _filename: &str) -> Result<Code, CompileError> {
        if mode == CompileMode::Repl && source.ends_with(':') {
            return Err(CompileError::NeedMoreLines);
        }
        if source.contains("!!") {
            return Err(CompileError::Syntax("invalid syntax".to_owned()));
        }
        let mut b = CodeBuilder::new("<module>");
        let k = b.add_const_int(42);
        b.emit_u16(Opcode::LoadConst, k);
        let x = b.add_name("x");
        b.emit_u16(Opcode::StoreName, x);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
        Ok(b.build())
    }
}

#[test]
fn test_exec_source_through_compiler_hook() {
    let mut vm = Vm::new();
    vm.set_compiler(Box::new(CannedCompiler));
    let main = vm.main_module();
    vm.exec_source("x = 42", "<test>", CompileMode::Exec, main).unwrap();
    assert_eq!(vm.get_global("x").unwrap().as_int(), Some(42));
}

#[test]
fn test_compile_errors_become_syntax_error() {
    let mut vm = Vm::new();
    vm.set_compiler(Box::new(CannedCompiler));
    let main = vm.main_module();
    let err = vm.exec_source("!!", "<test>", CompileMode::Exec, main).unwrap_err();
    match err {
        RunError::Value(exc) => assert_eq!(vm.exception_kind(exc), Some(ExcKind::SyntaxError)),
        RunError::Raise(kind, _) => assert_eq!(kind, ExcKind::SyntaxError),
    }
}

#[test]
fn test_repl_mode_reports_incomplete_input() {
    let mut vm = Vm::new();
    vm.set_compiler(Box::new(CannedCompiler));
    let err = vm.compile("if x:", CompileMode::Repl, "<repl>").unwrap_err();
    assert!(matches!(err, CompileError::NeedMoreLines));
}

#[test]
fn test_missing_compiler_is_reported() {
    let mut vm = Vm::new();
    let err = vm.compile("x = 1", CompileMode::Exec, "<test>").unwrap_err();
    assert!(matches!(err, CompileError::NoCompiler));
}

#[test]
fn test_json_mode_loads_literals_natively() {
    let mut vm = Vm::new();
    let main = vm.main_module();
    let v = vm
        .exec_source(r#"{"a": [1, 2.5, true, null], "b": "text"}"#, "<json>", CompileMode::Json, main)
        .unwrap();
    let key = vm.new_str("a");
    let items = vm.dict_get(v, key).unwrap().unwrap();
    assert_eq!(vm.py_len(items).unwrap(), 4);
    let first = vm.tuple_items(items).unwrap()[0];
    assert_eq!(first.as_int(), Some(1));

    let err = vm.json_loads("{not json").unwrap_err();
    match err {
        RunError::Raise(kind, _) => assert_eq!(kind, ExcKind::ValueError),
        RunError::Value(_) => panic!("json errors are native raises"),
    }
}
