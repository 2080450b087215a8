//! End-to-end interpreter scenarios driven through hand-assembled code
//! objects (the compiler is external to the runtime).

use std::sync::Arc;

use pretty_assertions::assert_eq;
use pyxis::{
    ExcKind, RunError, Value, Vm,
    bytecode::{BlockKind, CodeBuilder, FuncDecl, Opcode, ParamSpec},
};

/// Runs a module body against a fresh VM and returns the VM.
fn run_module(build: impl FnOnce(&mut CodeBuilder)) -> Vm {
    let mut vm = Vm::new();
    let mut b = CodeBuilder::new("<module>");
    build(&mut b);
    b.emit(Opcode::LoadNone);
    b.emit(Opcode::ReturnValue);
    let main = vm.main_module();
    vm.exec_code(b.build(), main).expect("module execution failed");
    assert_eq!(vm.stack_len(), 0, "operand stack must be empty between executions");
    vm
}

#[test]
fn test_exec_simple_arithmetic() {
    // x = 1 + 2
    let vm = run_module(|b| {
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit_i8(Opcode::LoadSmallInt, 2);
        b.emit(Opcode::BinaryAdd);
        let x = b.add_name("x");
        b.emit_u16(Opcode::StoreName, x);
    });
    assert_eq!(vm.get_global("x").unwrap().as_int(), Some(3));
}

#[test]
fn test_arithmetic_operator_family() {
    let mut vm = run_module(|b| {
        // a = 7 // 2, m = 7 % -3, d = 1 / 4, p = 2 ** 10, f = 1.5 + 1
        let store = |b: &mut CodeBuilder, name: &str| {
            let n = b.add_name(name);
            b.emit_u16(Opcode::StoreName, n);
        };
        b.emit_i8(Opcode::LoadSmallInt, 7);
        b.emit_i8(Opcode::LoadSmallInt, 2);
        b.emit(Opcode::BinaryFloorDiv);
        store(b, "a");
        b.emit_i8(Opcode::LoadSmallInt, 7);
        b.emit_i8(Opcode::LoadSmallInt, -3);
        b.emit(Opcode::BinaryMod);
        store(b, "m");
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit_i8(Opcode::LoadSmallInt, 4);
        b.emit(Opcode::BinaryTrueDiv);
        store(b, "d");
        b.emit_i8(Opcode::LoadSmallInt, 2);
        b.emit_i8(Opcode::LoadSmallInt, 10);
        b.emit(Opcode::BinaryPow);
        store(b, "p");
        let k = b.add_const_float(1.5);
        b.emit_u16(Opcode::LoadConst, k);
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit(Opcode::BinaryAdd);
        store(b, "f");
    });
    assert_eq!(vm.get_global("a").unwrap().as_int(), Some(3));
    // Python modulo follows the divisor's sign
    assert_eq!(vm.get_global("m").unwrap().as_int(), Some(-2));
    assert_eq!(vm.get_global("d").unwrap().as_float(), Some(0.25));
    assert_eq!(vm.get_global("p").unwrap().as_int(), Some(1024));
    // int + float resolves through the reflected slot
    assert_eq!(vm.get_global("f").unwrap().as_float(), Some(2.5));
    let f = vm.get_global("f").unwrap();
    assert_eq!(vm.py_repr(f).unwrap(), "2.5");
}

#[test]
fn test_full_argument_binding() {
    // def f(a, b=10, *c, **d): return (a, b, c, d)
    // result = f(1, 2, 3, 4, k=5)
    let mut vm = run_module(|b| {
        let mut fb = CodeBuilder::new("f");
        let a = fb.add_varname("a");
        let bb = fb.add_varname("b");
        let c = fb.add_varname("c");
        let d = fb.add_varname("d");
        fb.emit_u8(Opcode::LoadFast, a);
        fb.emit_u8(Opcode::LoadFast, bb);
        fb.emit_u8(Opcode::LoadFast, c);
        fb.emit_u8(Opcode::LoadFast, d);
        fb.emit_u16(Opcode::BuildTuple, 4);
        fb.emit(Opcode::ReturnValue);
        let decl = FuncDecl {
            name: "f".to_owned(),
            params: ParamSpec {
                args: vec!["a".to_owned(), "b".to_owned()],
                arg_defaults_count: 1,
                var_args: Some("c".to_owned()),
                kwonly: Vec::new(),
                kwonly_default_map: Vec::new(),
                var_kwargs: Some("d".to_owned()),
            },
            is_generator: false,
            code: Arc::new(fb.build()),
        };
        let decl_idx = b.add_function(decl);

        let k10 = b.add_const_int(10);
        b.emit_u16(Opcode::LoadConst, k10);
        b.emit_make_function(decl_idx, 1);
        // call f(1, 2, 3, 4, k=5) directly
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit_i8(Opcode::LoadSmallInt, 2);
        b.emit_i8(Opcode::LoadSmallInt, 3);
        b.emit_i8(Opcode::LoadSmallInt, 4);
        let key = b.add_const_str("k");
        b.emit_u16(Opcode::LoadConst, key);
        b.emit_i8(Opcode::LoadSmallInt, 5);
        b.emit_call(4, 1);
        let result = b.add_name("result");
        b.emit_u16(Opcode::StoreName, result);
    });

    let result = vm.get_global("result").unwrap();
    let repr = vm.py_repr(result).unwrap();
    assert_eq!(repr, "(1, 2, (3, 4), {'k': 5})");

    let expected = {
        let inner = vm.new_tuple(vec![Value::new_int(3), Value::new_int(4)]);
        let d = vm.new_dict();
        let key = vm.new_str("k");
        vm.dict_set(d, key, Value::new_int(5)).unwrap();
        vm.new_tuple(vec![Value::new_int(1), Value::new_int(2), inner, d])
    };
    assert!(vm.py_eq(result, expected).unwrap());
}

#[test]
fn test_defaults_fill_missing_parameters() {
    // def f(a, b=10): return (a, b); r = f(1)
    let mut vm = run_module(|b| {
        let mut fb = CodeBuilder::new("f");
        let a = fb.add_varname("a");
        let bb = fb.add_varname("b");
        fb.emit_u8(Opcode::LoadFast, a);
        fb.emit_u8(Opcode::LoadFast, bb);
        fb.emit_u16(Opcode::BuildTuple, 2);
        fb.emit(Opcode::ReturnValue);
        let decl = FuncDecl {
            name: "f".to_owned(),
            params: ParamSpec {
                args: vec!["a".to_owned(), "b".to_owned()],
                arg_defaults_count: 1,
                ..ParamSpec::default()
            },
            is_generator: false,
            code: Arc::new(fb.build()),
        };
        let decl_idx = b.add_function(decl);
        let k10 = b.add_const_int(10);
        b.emit_u16(Opcode::LoadConst, k10);
        b.emit_make_function(decl_idx, 1);
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit_call(1, 0);
        let r = b.add_name("r");
        b.emit_u16(Opcode::StoreName, r);
    });
    let r = vm.get_global("r").unwrap();
    assert_eq!(vm.py_repr(r).unwrap(), "(1, 10)");
}

#[test]
fn test_missing_argument_raises_type_error() {
    let mut vm = Vm::new();
    let mut b = CodeBuilder::new("<module>");
    let mut fb = CodeBuilder::new("f");
    let _ = fb.add_varname("a");
    fb.emit(Opcode::LoadNone);
    fb.emit(Opcode::ReturnValue);
    let decl = FuncDecl {
        name: "f".to_owned(),
        params: ParamSpec::positional(&["a"]),
        is_generator: false,
        code: Arc::new(fb.build()),
    };
    let decl_idx = b.add_function(decl);
    b.emit_make_function(decl_idx, 0);
    b.emit_call(0, 0);
    b.emit(Opcode::ReturnValue);
    let main = vm.main_module();
    let err = vm.exec_code(b.build(), main).unwrap_err();
    let RunError::Value(exc) = err else {
        panic!("expected a materialised exception");
    };
    assert_eq!(vm.exception_kind(exc), Some(ExcKind::TypeError));
}

#[test]
fn test_try_except_catches_and_binds() {
    // try: raise ValueError('x')
    // except ValueError as e: y = str(e)
    let mut vm = run_module(|b| {
        let try_block = b.enter_block(BlockKind::TryExcept);
        let value_error = b.add_name("ValueError");
        b.emit_u16(Opcode::LoadName, value_error);
        let msg = b.add_const_str("x");
        b.emit_u16(Opcode::LoadConst, msg);
        b.emit_call(1, 0);
        b.emit(Opcode::Raise);
        b.exit_block();
        let done = b.emit_jump(Opcode::Jump);

        // handler: [exc]
        b.set_block_end(try_block, b.current_offset());
        b.adjust_stack_depth(1);
        b.emit_u16(Opcode::LoadName, value_error);
        b.emit(Opcode::ExcMatch);
        let no_match = b.emit_jump(Opcode::PopJumpIfFalse);
        b.emit(Opcode::Dup);
        let e_slot = b.add_varname("e");
        b.emit_u8(Opcode::StoreFast, e_slot);
        let str_name = b.add_name("str");
        b.emit_u16(Opcode::LoadName, str_name);
        b.emit_u8(Opcode::LoadFast, e_slot);
        b.emit_call(1, 0);
        let y = b.add_name("y");
        b.emit_u16(Opcode::StoreName, y);
        b.emit(Opcode::PopException);
        let out = b.emit_jump(Opcode::Jump);
        b.patch_jump(no_match);
        b.adjust_stack_depth(1);
        b.emit(Opcode::Reraise);
        b.patch_jump(done);
        b.patch_jump(out);
    });
    let y = vm.get_global("y").unwrap();
    assert_eq!(vm.str_of(y), Some("x"));
    // the handler ran and cleared the exception
    assert!(vm.current_exception().is_none());
}

#[test]
fn test_unmatched_handler_reraises_to_caller() {
    // try: raise KeyError('k')
    // except ValueError: pass          -> escapes as KeyError
    let mut vm = Vm::new();
    let mut b = CodeBuilder::new("<module>");
    let try_block = b.enter_block(BlockKind::TryExcept);
    let key_error = b.add_name("KeyError");
    b.emit_u16(Opcode::LoadName, key_error);
    b.emit_call(0, 0);
    b.emit(Opcode::Raise);
    b.exit_block();
    let done = b.emit_jump(Opcode::Jump);

    b.set_block_end(try_block, b.current_offset());
    b.adjust_stack_depth(1);
    let value_error = b.add_name("ValueError");
    b.emit_u16(Opcode::LoadName, value_error);
    b.emit(Opcode::ExcMatch);
    let no_match = b.emit_jump(Opcode::PopJumpIfFalse);
    b.emit(Opcode::PopException);
    let out = b.emit_jump(Opcode::Jump);
    b.patch_jump(no_match);
    b.adjust_stack_depth(1);
    b.emit(Opcode::Reraise);
    b.patch_jump(done);
    b.patch_jump(out);
    b.emit(Opcode::LoadNone);
    b.emit(Opcode::ReturnValue);

    let main = vm.main_module();
    let err = vm.exec_code(b.build(), main).unwrap_err();
    let RunError::Value(exc) = err else {
        panic!("expected a materialised exception");
    };
    assert_eq!(vm.exception_kind(exc), Some(ExcKind::KeyError));
}

#[test]
fn test_for_loop_over_range_with_list_append() {
    // xs = []
    // for i in range(5): xs.append(i * i)
    let mut vm = run_module(|b| {
        b.emit_u16(Opcode::BuildList, 0);
        let xs = b.add_name("xs");
        b.emit_u16(Opcode::StoreName, xs);

        let range_name = b.add_name("range");
        b.emit_u16(Opcode::LoadName, range_name);
        b.emit_i8(Opcode::LoadSmallInt, 5);
        b.emit_call(1, 0);
        b.emit(Opcode::GetIter);

        let _block = b.enter_block(BlockKind::ForLoop);
        let loop_start = b.current_offset();
        let exit = b.emit_jump(Opcode::ForIter);
        let i_slot = b.add_varname("i");
        b.emit_u8(Opcode::StoreFast, i_slot);
        b.emit_u16(Opcode::LoadName, xs);
        let append = b.add_name("append");
        b.emit_u16(Opcode::LoadAttr, append);
        b.emit_u8(Opcode::LoadFast, i_slot);
        b.emit_u8(Opcode::LoadFast, i_slot);
        b.emit(Opcode::BinaryMul);
        b.emit_call(1, 0);
        b.emit(Opcode::Pop);
        b.emit_jump_to(Opcode::Jump, loop_start);
        b.exit_block();
        b.patch_jump(exit);

        let sum_name = b.add_name("sum");
        b.emit_u16(Opcode::LoadName, sum_name);
        b.emit_u16(Opcode::LoadName, xs);
        b.emit_call(1, 0);
        let total = b.add_name("total");
        b.emit_u16(Opcode::StoreName, total);
    });
    assert_eq!(vm.get_global("total").unwrap().as_int(), Some(0 + 1 + 4 + 9 + 16));
    let xs = vm.get_global("xs").unwrap();
    assert_eq!(vm.py_len(xs).unwrap(), 5);
}

#[test]
fn test_break_exits_loop_through_block_table() {
    // n = 0
    // for i in range(10):
    //     if i == 3: break
    //     n = n + 1
    let vm = run_module(|b| {
        let n = b.add_name("n");
        b.emit_i8(Opcode::LoadSmallInt, 0);
        b.emit_u16(Opcode::StoreName, n);

        let range_name = b.add_name("range");
        b.emit_u16(Opcode::LoadName, range_name);
        b.emit_i8(Opcode::LoadSmallInt, 10);
        b.emit_call(1, 0);
        b.emit(Opcode::GetIter);

        let _block = b.enter_block(BlockKind::ForLoop);
        let loop_start = b.current_offset();
        let exit = b.emit_jump(Opcode::ForIter);
        let i_slot = b.add_varname("i");
        b.emit_u8(Opcode::StoreFast, i_slot);

        b.emit_u8(Opcode::LoadFast, i_slot);
        b.emit_i8(Opcode::LoadSmallInt, 3);
        b.emit(Opcode::CompareEq);
        let no_break = b.emit_jump(Opcode::PopJumpIfFalse);
        let brk = b.emit_jump(Opcode::JumpBreak);
        b.patch_jump(no_break);

        b.emit_u16(Opcode::LoadName, n);
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit(Opcode::BinaryAdd);
        b.emit_u16(Opcode::StoreName, n);
        b.emit_jump_to(Opcode::Jump, loop_start);
        b.exit_block();
        b.patch_jump(exit);
        b.patch_jump(brk);
    });
    assert_eq!(vm.get_global("n").unwrap().as_int(), Some(3));
}

#[test]
fn test_inheritance_and_two_argument_super() {
    // class A:      def f(self): return 1
    // class B(A):   def f(self): return super(B, self).f() + 1
    // r = B().f()
    let vm = run_module(|b| {
        let mut af = CodeBuilder::new("f");
        let _self = af.add_varname("self");
        af.emit_i8(Opcode::LoadSmallInt, 1);
        af.emit(Opcode::ReturnValue);
        let a_decl = b.add_function(FuncDecl {
            name: "f".to_owned(),
            params: ParamSpec::positional(&["self"]),
            is_generator: false,
            code: Arc::new(af.build()),
        });

        let mut bf = CodeBuilder::new("f");
        let self_slot = bf.add_varname("self");
        let super_name = bf.add_name("super");
        bf.emit_u16(Opcode::LoadName, super_name);
        let b_name_in_f = bf.add_name("B");
        bf.emit_u16(Opcode::LoadName, b_name_in_f);
        bf.emit_u8(Opcode::LoadFast, self_slot);
        bf.emit_call(2, 0);
        let f_attr = bf.add_name("f");
        bf.emit_u16(Opcode::LoadAttr, f_attr);
        bf.emit_call(0, 0);
        bf.emit_i8(Opcode::LoadSmallInt, 1);
        bf.emit(Opcode::BinaryAdd);
        bf.emit(Opcode::ReturnValue);
        let b_decl = b.add_function(FuncDecl {
            name: "f".to_owned(),
            params: ParamSpec::positional(&["self"]),
            is_generator: false,
            code: Arc::new(bf.build()),
        });

        // class A
        let f_key = b.add_const_str("f");
        b.emit_u16(Opcode::LoadConst, f_key);
        b.emit_make_function(a_decl, 0);
        b.emit_u16(Opcode::BuildDict, 1);
        let a_name = b.add_name("A");
        b.emit_build_class(a_name, false);
        b.emit_u16(Opcode::StoreName, a_name);

        // class B(A)
        b.emit_u16(Opcode::LoadName, a_name);
        b.emit_u16(Opcode::LoadConst, f_key);
        b.emit_make_function(b_decl, 0);
        b.emit_u16(Opcode::BuildDict, 1);
        let b_name = b.add_name("B");
        b.emit_build_class(b_name, true);
        b.emit_u16(Opcode::StoreName, b_name);

        // r = B().f()
        b.emit_u16(Opcode::LoadName, b_name);
        b.emit_call(0, 0);
        let f_name = b.add_name("f");
        b.emit_u16(Opcode::LoadAttr, f_name);
        b.emit_call(0, 0);
        let r = b.add_name("r");
        b.emit_u16(Opcode::StoreName, r);
    });
    assert_eq!(vm.get_global("r").unwrap().as_int(), Some(2));
}

#[test]
fn test_instance_attributes_and_init() {
    // class P:
    //     def __init__(self, x): self.x = x
    // p = P(9); r = p.x
    let vm = run_module(|b| {
        let mut init = CodeBuilder::new("__init__");
        let self_slot = init.add_varname("self");
        let x_slot = init.add_varname("x");
        init.emit_u8(Opcode::LoadFast, x_slot);
        init.emit_u8(Opcode::LoadFast, self_slot);
        let x_attr = init.add_name("x");
        init.emit_u16(Opcode::StoreAttr, x_attr);
        init.emit(Opcode::LoadNone);
        init.emit(Opcode::ReturnValue);
        let init_decl = b.add_function(FuncDecl {
            name: "__init__".to_owned(),
            params: ParamSpec::positional(&["self", "x"]),
            is_generator: false,
            code: Arc::new(init.build()),
        });

        let init_key = b.add_const_str("__init__");
        b.emit_u16(Opcode::LoadConst, init_key);
        b.emit_make_function(init_decl, 0);
        b.emit_u16(Opcode::BuildDict, 1);
        let p_name = b.add_name("P");
        b.emit_build_class(p_name, false);
        b.emit_u16(Opcode::StoreName, p_name);

        b.emit_u16(Opcode::LoadName, p_name);
        b.emit_i8(Opcode::LoadSmallInt, 9);
        b.emit_call(1, 0);
        let p_var = b.add_name("p");
        b.emit_u16(Opcode::StoreName, p_var);

        b.emit_u16(Opcode::LoadName, p_var);
        let x_attr = b.add_name("x");
        b.emit_u16(Opcode::LoadAttr, x_attr);
        let r = b.add_name("r");
        b.emit_u16(Opcode::StoreName, r);
    });
    assert_eq!(vm.get_global("r").unwrap().as_int(), Some(9));
}

#[test]
fn test_context_manager_enter_exit() {
    // class CM:
    //     def __enter__(self): return 7
    //     def __exit__(self): log.append('exited')
    // with CM() as v: r = v
    let mut vm = run_module(|b| {
        let mut enter = CodeBuilder::new("__enter__");
        let _self = enter.add_varname("self");
        enter.emit_i8(Opcode::LoadSmallInt, 7);
        enter.emit(Opcode::ReturnValue);
        let enter_decl = b.add_function(FuncDecl {
            name: "__enter__".to_owned(),
            params: ParamSpec::positional(&["self"]),
            is_generator: false,
            code: Arc::new(enter.build()),
        });

        let mut exit = CodeBuilder::new("__exit__");
        let _self = exit.add_varname("self");
        let log_name = exit.add_name("log");
        exit.emit_u16(Opcode::LoadName, log_name);
        let append = exit.add_name("append");
        exit.emit_u16(Opcode::LoadAttr, append);
        let msg = exit.add_const_str("exited");
        exit.emit_u16(Opcode::LoadConst, msg);
        exit.emit_call(1, 0);
        exit.emit(Opcode::ReturnValue);
        let exit_decl = b.add_function(FuncDecl {
            name: "__exit__".to_owned(),
            params: ParamSpec::positional(&["self"]),
            is_generator: false,
            code: Arc::new(exit.build()),
        });

        // log = []
        b.emit_u16(Opcode::BuildList, 0);
        let log = b.add_name("log");
        b.emit_u16(Opcode::StoreName, log);

        let enter_key = b.add_const_str("__enter__");
        b.emit_u16(Opcode::LoadConst, enter_key);
        b.emit_make_function(enter_decl, 0);
        let exit_key = b.add_const_str("__exit__");
        b.emit_u16(Opcode::LoadConst, exit_key);
        b.emit_make_function(exit_decl, 0);
        b.emit_u16(Opcode::BuildDict, 2);
        let cm_name = b.add_name("CM");
        b.emit_build_class(cm_name, false);
        b.emit_u16(Opcode::StoreName, cm_name);

        // with CM() as v:
        b.emit_u16(Opcode::LoadName, cm_name);
        b.emit_call(0, 0);
        b.emit(Opcode::WithEnter);
        let v = b.add_name("v");
        b.emit_u16(Opcode::StoreName, v);
        let _block = b.enter_block(BlockKind::ContextManager);
        b.emit_u16(Opcode::LoadName, v);
        let r = b.add_name("r");
        b.emit_u16(Opcode::StoreName, r);
        b.exit_block();
        b.emit(Opcode::WithExit);
    });
    assert_eq!(vm.get_global("r").unwrap().as_int(), Some(7));
    let log = vm.get_global("log").unwrap();
    assert_eq!(vm.py_len(log).unwrap(), 1);
}

#[test]
fn test_subscripts_and_unpack() {
    // d = {}; d['k'] = 3; a = d['k']
    // t = (1, 2); x, y = t
    let vm = run_module(|b| {
        b.emit_u16(Opcode::BuildDict, 0);
        let d = b.add_name("d");
        b.emit_u16(Opcode::StoreName, d);

        b.emit_i8(Opcode::LoadSmallInt, 3);
        b.emit_u16(Opcode::LoadName, d);
        let key = b.add_const_str("k");
        b.emit_u16(Opcode::LoadConst, key);
        b.emit(Opcode::StoreSubscr);

        b.emit_u16(Opcode::LoadName, d);
        b.emit_u16(Opcode::LoadConst, key);
        b.emit(Opcode::LoadSubscr);
        let a = b.add_name("a");
        b.emit_u16(Opcode::StoreName, a);

        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit_i8(Opcode::LoadSmallInt, 2);
        b.emit_u16(Opcode::BuildTuple, 2);
        b.emit_u8(Opcode::UnpackSequence, 2);
        let x = b.add_name("x");
        b.emit_u16(Opcode::StoreName, x);
        let y = b.add_name("y");
        b.emit_u16(Opcode::StoreName, y);
    });
    assert_eq!(vm.get_global("a").unwrap().as_int(), Some(3));
    assert_eq!(vm.get_global("x").unwrap().as_int(), Some(1));
    assert_eq!(vm.get_global("y").unwrap().as_int(), Some(2));
}

#[test]
fn test_comparisons_and_identity() {
    let vm = run_module(|b| {
        let store = |b: &mut CodeBuilder, name: &str| {
            let n = b.add_name(name);
            b.emit_u16(Opcode::StoreName, n);
        };
        b.emit_i8(Opcode::LoadSmallInt, 3);
        b.emit_i8(Opcode::LoadSmallInt, 5);
        b.emit(Opcode::CompareLt);
        store(b, "lt");
        b.emit_i8(Opcode::LoadSmallInt, 3);
        let k = b.add_const_float(3.0);
        b.emit_u16(Opcode::LoadConst, k);
        b.emit(Opcode::CompareEq);
        store(b, "eq");
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::LoadNone);
        b.emit_u8(Opcode::IsOp, 0);
        store(b, "same");
        b.emit_i8(Opcode::LoadSmallInt, 2);
        b.emit_i8(Opcode::LoadSmallInt, 1);
        b.emit_i8(Opcode::LoadSmallInt, 2);
        b.emit_u16(Opcode::BuildTuple, 2);
        b.emit_u8(Opcode::ContainsOp, 0);
        store(b, "found");
    });
    assert_eq!(vm.get_global("lt").unwrap().as_bool(), Some(true));
    assert_eq!(vm.get_global("eq").unwrap().as_bool(), Some(true));
    assert_eq!(vm.get_global("same").unwrap().as_bool(), Some(true));
    assert_eq!(vm.get_global("found").unwrap().as_bool(), Some(true));
}

#[test]
fn test_call_value_reentrant_api() {
    let mut vm = Vm::new();
    let chr = vm.get_builtin("chr").unwrap();
    let out = vm.call_value(chr, &[Value::new_int(65)]).unwrap();
    assert_eq!(vm.str_of(out), Some("A"));
}

#[test]
fn test_retval_untouched_by_failed_native_call() {
    let mut vm = Vm::new();
    let chr = vm.get_builtin("chr").unwrap();
    vm.call_value(chr, &[Value::new_int(66)]).unwrap();
    let before = vm.retval();
    let _ = vm.call_value(chr, &[Value::new_int(-5)]).unwrap_err();
    assert!(vm.is_identical(vm.retval(), before));
}
