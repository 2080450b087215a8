//! Module registry and import resolution through the host hooks.

use pretty_assertions::assert_eq;
use pyxis::{
    CompileError, CompileMode, Compiler, ExcKind, Hooks, RunError, Vm,
    bytecode::{Code, CodeBuilder, Opcode},
};

/// A compiler that lowers any source to `value = <n>` where `n` counts the
/// compilations, so reload effects are observable.
struct CountingCompiler {
    compilations: i64,
}

impl Compiler for CountingCompiler {
    fn compile(&mut self, _source: &str, _mode: CompileMode, _filename: &str) -> Result<Code, CompileError> {
        self.compilations += 1;
        let mut b = CodeBuilder::new("<module>");
        let k = b.add_const_int(self.compilations);
        b.emit_u16(Opcode::LoadConst, k);
        let name = b.add_name("value");
        b.emit_u16(Opcode::StoreName, name);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
        Ok(b.build())
    }
}

fn import_ready_vm() -> Vm {
    let hooks = Hooks {
        importfile: Box::new(|filename| {
            let sep = std::path::MAIN_SEPARATOR;
            if filename == "mylib.py" || filename == format!("pkg{sep}__init__.py") {
                Some(String::from("value = 0")) // content is canned by the compiler
            } else {
                None
            }
        }),
        ..Hooks::stdio()
    };
    let mut vm = Vm::with_hooks(hooks);
    vm.set_compiler(Box::new(CountingCompiler { compilations: 0 }));
    vm
}

#[test]
fn test_new_module_prepopulates_identity_attrs() {
    let mut vm = Vm::new();
    let module = vm.new_module("a.b.c");
    let name = vm.getattr_by_name(module, "__name__").unwrap();
    assert_eq!(vm.str_of(name), Some("c"));
    let package = vm.getattr_by_name(module, "__package__").unwrap();
    assert_eq!(vm.str_of(package), Some("a.b"));
    let path = vm.getattr_by_name(module, "__path__").unwrap();
    assert_eq!(vm.str_of(path), Some("a.b.c"));
}

#[test]
fn test_import_resolves_module_file() {
    let mut vm = import_ready_vm();
    let module = vm.import_module("mylib").unwrap();
    let value = vm.getattr_by_name(module, "value").unwrap();
    assert_eq!(value.as_int(), Some(1));

    // importing again answers from the registry without recompiling
    let again = vm.import_module("mylib").unwrap();
    assert_eq!(again, module);
    let value = vm.getattr_by_name(again, "value").unwrap();
    assert_eq!(value.as_int(), Some(1));
}

#[test]
fn test_import_falls_back_to_package_init() {
    let mut vm = import_ready_vm();
    let module = vm.import_module("pkg").unwrap();
    let value = vm.getattr_by_name(module, "value").unwrap();
    assert_eq!(value.as_int(), Some(1));
}

#[test]
fn test_missing_module_raises_import_error() {
    let mut vm = import_ready_vm();
    let err = vm.import_module("nope").unwrap_err();
    match err {
        RunError::Raise(kind, _) => assert_eq!(kind, ExcKind::ImportError),
        RunError::Value(exc) => assert_eq!(vm.exception_kind(exc), Some(ExcKind::ImportError)),
    }
}

#[test]
fn test_reload_reexecutes_into_same_module() {
    let mut vm = import_ready_vm();
    let module = vm.import_module("mylib").unwrap();
    let value = vm.getattr_by_name(module, "value").unwrap();
    assert_eq!(value.as_int(), Some(1));

    let reloaded = vm.reload_module(module).unwrap();
    assert_eq!(reloaded, module);
    let value = vm.getattr_by_name(module, "value").unwrap();
    assert_eq!(value.as_int(), Some(2));
}

#[test]
fn test_import_name_opcode() {
    let mut vm = import_ready_vm();
    let mut b = CodeBuilder::new("<module>");
    let path = b.add_name("mylib");
    b.emit_u16(Opcode::ImportName, path);
    b.emit_u16(Opcode::StoreName, path);
    b.emit(Opcode::LoadNone);
    b.emit(Opcode::ReturnValue);
    let main = vm.main_module();
    vm.exec_code(b.build(), main).unwrap();
    let module = vm.get_global("mylib").unwrap();
    let value = vm.getattr_by_name(module, "value").unwrap();
    assert_eq!(value.as_int(), Some(1));
}

#[test]
fn test_relative_import_walks_package_path() {
    let hooks = Hooks {
        importfile: Box::new(|filename| {
            let sep = std::path::MAIN_SEPARATOR;
            let sibling = format!("a{sep}sibling.py");
            if filename == sibling { Some(String::from("value = 0")) } else { None }
        }),
        ..Hooks::stdio()
    };
    let mut vm = Vm::with_hooks(hooks);
    vm.set_compiler(Box::new(CountingCompiler { compilations: 0 }));

    // executing inside module "a.b", `from . import sibling` resolves to
    // "a.sibling"
    let importer = vm.new_module("a.b");
    let mut b = CodeBuilder::new("<module>");
    let rel = b.add_name(".sibling");
    b.emit_u16(Opcode::ImportName, rel);
    let out = b.add_name("out");
    b.emit_u16(Opcode::StoreName, out);
    b.emit(Opcode::LoadNone);
    b.emit(Opcode::ReturnValue);
    vm.exec_code(b.build(), importer).unwrap();

    assert!(vm.get_module("a.sibling").is_some());
}

#[test]
fn test_exceptions_are_visible_as_builtins() {
    let vm = Vm::new();
    for name in ["ValueError", "TypeError", "StopIteration", "BaseException", "RecursionError"] {
        assert!(vm.get_builtin(name).is_some(), "missing builtin exception {name}");
    }
}
