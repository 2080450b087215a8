//! Boundary behaviors: integer overflow, chr range checks, division by
//! zero, and the recursion limit.

use std::sync::Arc;

use pyxis::{
    ExcKind, RunError, Value, Vm,
    bytecode::{CodeBuilder, FuncDecl, Opcode, ParamSpec},
};

fn expect_kind(vm: &Vm, err: RunError, kind: ExcKind) {
    match err {
        RunError::Value(exc) => assert_eq!(vm.exception_kind(exc), Some(kind)),
        RunError::Raise(raised, _) => assert_eq!(raised, kind),
    }
}

fn run_expr(vm: &mut Vm, build: impl FnOnce(&mut CodeBuilder)) -> Result<Value, RunError> {
    let mut b = CodeBuilder::new("<module>");
    build(&mut b);
    b.emit(Opcode::ReturnValue);
    let main = vm.main_module();
    vm.exec_code(b.build(), main)
}

#[test]
fn test_integer_overflow_raises() {
    let mut vm = Vm::new();
    // i64::MAX + 1
    let err = run_expr(&mut vm, |b| {
        let k = b.add_const_int(i64::MAX);
        b.emit_u16(Opcode::LoadConst, k);
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit(Opcode::BinaryAdd);
    })
    .unwrap_err();
    expect_kind(&vm, err, ExcKind::OverflowError);

    // i64::MIN * -1 through the multiply slot
    let err = run_expr(&mut vm, |b| {
        let k = b.add_const_int(i64::MIN);
        b.emit_u16(Opcode::LoadConst, k);
        b.emit_i8(Opcode::LoadSmallInt, -1);
        b.emit(Opcode::BinaryMul);
    })
    .unwrap_err();
    expect_kind(&vm, err, ExcKind::OverflowError);

    // unary negation of i64::MIN
    let err = run_expr(&mut vm, |b| {
        let k = b.add_const_int(i64::MIN);
        b.emit_u16(Opcode::LoadConst, k);
        b.emit(Opcode::UnaryNeg);
    })
    .unwrap_err();
    expect_kind(&vm, err, ExcKind::OverflowError);
}

#[test]
fn test_division_by_zero_both_operators() {
    let mut vm = Vm::new();
    let err = run_expr(&mut vm, |b| {
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit_i8(Opcode::LoadSmallInt, 0);
        b.emit(Opcode::BinaryFloorDiv);
    })
    .unwrap_err();
    expect_kind(&vm, err, ExcKind::ZeroDivisionError);

    let err = run_expr(&mut vm, |b| {
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit_i8(Opcode::LoadSmallInt, 0);
        b.emit(Opcode::BinaryTrueDiv);
    })
    .unwrap_err();
    expect_kind(&vm, err, ExcKind::ZeroDivisionError);

    let err = run_expr(&mut vm, |b| {
        let k = b.add_const_float(1.5);
        b.emit_u16(Opcode::LoadConst, k);
        b.emit_i8(Opcode::LoadSmallInt, 0);
        b.emit(Opcode::BinaryTrueDiv);
    })
    .unwrap_err();
    expect_kind(&vm, err, ExcKind::ZeroDivisionError);
}

#[test]
fn test_chr_range_checks() {
    let mut vm = Vm::new();
    let chr = vm.get_builtin("chr").unwrap();

    let ok = vm.call_value(chr, &[Value::new_int(0x10FFFF)]);
    assert!(ok.is_ok());

    for bad in [-1_i64, 0x110000, 0xD800] {
        let err = vm.call_value(chr, &[Value::new_int(bad)]).unwrap_err();
        expect_kind(&vm, err, ExcKind::ValueError);
    }
}

#[test]
fn test_recursion_limit_raises_instead_of_host_overflow() {
    let mut vm = Vm::new();
    vm.set_recursion_limit(64);

    // def f(): return f()
    let mut b = CodeBuilder::new("<module>");
    let mut fb = CodeBuilder::new("f");
    let f_name_inner = fb.add_name("f");
    fb.emit_u16(Opcode::LoadName, f_name_inner);
    fb.emit_call(0, 0);
    fb.emit(Opcode::ReturnValue);
    let decl = b.add_function(FuncDecl {
        name: "f".to_owned(),
        params: ParamSpec::default(),
        is_generator: false,
        code: Arc::new(fb.build()),
    });
    b.emit_make_function(decl, 0);
    let f_name = b.add_name("f");
    b.emit_u16(Opcode::StoreName, f_name);
    b.emit_u16(Opcode::LoadName, f_name);
    b.emit_call(0, 0);
    b.emit(Opcode::ReturnValue);

    let main = vm.main_module();
    let err = vm.exec_code(b.build(), main).unwrap_err();
    expect_kind(&vm, err, ExcKind::RecursionError);
}

#[test]
fn test_shift_boundaries() {
    let mut vm = Vm::new();
    let err = run_expr(&mut vm, |b| {
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit_i8(Opcode::LoadSmallInt, -1);
        b.emit(Opcode::BinaryLShift);
    })
    .unwrap_err();
    expect_kind(&vm, err, ExcKind::ValueError);

    let v = run_expr(&mut vm, |b| {
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit_i8(Opcode::LoadSmallInt, 4);
        b.emit(Opcode::BinaryLShift);
    })
    .unwrap();
    assert_eq!(v.as_int(), Some(16));
}

#[test]
fn test_unsupported_operands_raise_type_error() {
    let mut vm = Vm::new();
    let err = run_expr(&mut vm, |b| {
        b.emit_i8(Opcode::LoadSmallInt, 1);
        let k = b.add_const_str("x");
        b.emit_u16(Opcode::LoadConst, k);
        b.emit(Opcode::BinarySub);
    })
    .unwrap_err();
    expect_kind(&vm, err, ExcKind::TypeError);
}
