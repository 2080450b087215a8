//! Parallel VM slots: independent interpreters communicating only through
//! pickled payloads.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use pyxis::{
    ComputeThread, Value, Vm,
    bytecode::{Code, CodeBuilder, FuncDecl, Opcode, ParamSpec},
};

/// `sum(range(1_000_000))` as an expression body.
fn big_sum_code() -> Code {
    let mut b = CodeBuilder::new("<eval>");
    let sum_name = b.add_name("sum");
    b.emit_u16(Opcode::LoadName, sum_name);
    let range_name = b.add_name("range");
    b.emit_u16(Opcode::LoadName, range_name);
    let k = b.add_const_int(1_000_000);
    b.emit_u16(Opcode::LoadConst, k);
    b.emit_call(1, 0);
    b.emit_call(1, 0);
    b.emit(Opcode::ReturnValue);
    b.build()
}

#[test]
fn test_parallel_sums_agree_and_stay_isolated() {
    let mut host = Vm::new();
    // the host's globals are invisible to the workers
    host.set_global("marker", Value::new_int(999));

    let mut first = ComputeThread::new().unwrap();
    let mut second = ComputeThread::new().unwrap();
    first.submit_eval(big_sum_code()).unwrap();
    second.submit_eval(big_sum_code()).unwrap();

    let a = first.join(&mut host).unwrap();
    let b = second.join(&mut host).unwrap();
    assert_eq!(a.as_int(), Some(499_999_500_000));
    assert_eq!(b.as_int(), Some(499_999_500_000));
    assert_eq!(host.get_global("marker").unwrap().as_int(), Some(999));
}

#[test]
fn test_submit_call_with_pickled_arguments() {
    // worker module: def add3(a, b, c): return a + b + c
    let mut module = CodeBuilder::new("<module>");
    let mut fb = CodeBuilder::new("add3");
    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        let slot = fb.add_varname(name);
        fb.emit_u8(Opcode::LoadFast, slot);
        if i > 0 {
            fb.emit(Opcode::BinaryAdd);
        }
    }
    fb.emit(Opcode::ReturnValue);
    let decl = module.add_function(FuncDecl {
        name: "add3".to_owned(),
        params: ParamSpec::positional(&["a", "b", "c"]),
        is_generator: false,
        code: Arc::new(fb.build()),
    });
    module.emit_make_function(decl, 0);
    let name = module.add_name("add3");
    module.emit_u16(Opcode::StoreName, name);
    module.emit(Opcode::LoadNone);
    module.emit(Opcode::ReturnValue);

    let mut host = Vm::new();
    let mut worker = ComputeThread::new().unwrap();
    worker
        .submit_call(&mut host, module.build(), "add3", &[
            Value::new_int(10),
            Value::new_int(20),
            Value::new_int(12),
        ])
        .unwrap();
    let result = worker.join(&mut host).unwrap();
    assert_eq!(result.as_int(), Some(42));
}

#[test]
fn test_worker_exception_surfaces_as_error() {
    // 1 // 0 in the worker
    let mut b = CodeBuilder::new("<eval>");
    b.emit_i8(Opcode::LoadSmallInt, 1);
    b.emit_i8(Opcode::LoadSmallInt, 0);
    b.emit(Opcode::BinaryFloorDiv);
    b.emit(Opcode::ReturnValue);

    let mut host = Vm::new();
    let mut worker = ComputeThread::new().unwrap();
    worker.submit_eval(b.build()).unwrap();
    let err = worker.join(&mut host).unwrap_err();
    assert!(err.to_string().contains("ZeroDivisionError"));
}

#[test]
fn test_busy_thread_rejects_submission() {
    let mut b = CodeBuilder::new("<eval>");
    b.emit(Opcode::LoadNone);
    b.emit(Opcode::ReturnValue);
    let code_a = b.build();

    let mut worker = ComputeThread::new().unwrap();
    worker.submit_eval(code_a).unwrap();
    // the slot holds one job at a time
    let mut b2 = CodeBuilder::new("<eval>");
    b2.emit(Opcode::LoadNone);
    b2.emit(Opcode::ReturnValue);
    assert!(worker.submit_eval(b2.build()).is_err());

    let mut host = Vm::new();
    let _ = worker.join(&mut host).unwrap();
    // after join the slot is reusable
    let mut b3 = CodeBuilder::new("<eval>");
    b3.emit(Opcode::LoadNone);
    b3.emit(Opcode::ReturnValue);
    worker.submit_eval(b3.build()).unwrap();
    let _ = worker.join(&mut host).unwrap();
}
