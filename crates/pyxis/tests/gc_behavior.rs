//! Collector behavior observed through the public surface: reachability,
//! idempotence, and interaction with executed code.

use pretty_assertions::assert_eq;
use pyxis::{
    Value, Vm,
    bytecode::{BlockKind, CodeBuilder, Opcode},
};

#[test]
fn test_collect_after_loop_keeps_reachable_list() {
    // xs = [i * i for i in range(100)], then collect twice
    let mut vm = Vm::new();
    let mut b = CodeBuilder::new("<module>");
    b.emit_u16(Opcode::BuildList, 0);
    let xs = b.add_name("xs");
    b.emit_u16(Opcode::StoreName, xs);

    let range_name = b.add_name("range");
    b.emit_u16(Opcode::LoadName, range_name);
    let k100 = b.add_const_int(100);
    b.emit_u16(Opcode::LoadConst, k100);
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
    b.emit(Opcode::LoadNone);
    b.emit(Opcode::ReturnValue);

    let main = vm.main_module();
    vm.exec_code(b.build(), main).unwrap();

    // temporaries (iterator, bound methods, range) die at the first sweep
    vm.collect_garbage();
    // with no intervening allocation, a second collection frees nothing
    assert_eq!(vm.collect_garbage(), 0);

    let xs_value = vm.get_global("xs").unwrap();
    assert_eq!(vm.py_len(xs_value).unwrap(), 100);
    let sum_fn = vm.get_builtin("sum").unwrap();
    let total = vm.call_value(sum_fn, &[xs_value]).unwrap();
    assert_eq!(total.as_int(), Some(328350));
}

#[test]
fn test_unreachable_values_are_freed() {
    let mut vm = Vm::new();
    vm.collect_garbage();
    let baseline = vm.heap_live_count();

    // a global keeps its list alive across collections
    let kept = vm.new_list(vec![Value::new_int(1)]);
    vm.set_global("kept", kept);
    // nothing keeps this one
    let _orphan = vm.new_list(vec![Value::new_int(2)]);

    let freed = vm.collect_garbage();
    assert_eq!(freed, 1);
    assert_eq!(vm.heap_live_count(), baseline + 1);

    let still = vm.get_global("kept").unwrap();
    assert_eq!(vm.py_len(still).unwrap(), 1);
}

#[test]
fn test_registers_and_retval_are_roots() {
    let mut vm = Vm::new();
    vm.collect_garbage();

    let pinned = vm.new_str("register-held");
    vm.reg[0] = pinned;
    vm.collect_garbage();
    assert_eq!(vm.str_of(vm.reg[0]), Some("register-held"));

    vm.reg[0] = Value::NIL;
    let freed = vm.collect_garbage();
    assert_eq!(freed, 1);
}

#[test]
fn test_modules_survive_collection() {
    let mut vm = Vm::new();
    let module = vm.new_module("persistent");
    vm.collect_garbage();
    // registry entries are process-lifetime roots
    assert_eq!(vm.get_module("persistent"), Some(module));
    let attr = vm.getattr_by_name(module, "__name__").unwrap();
    assert_eq!(vm.str_of(attr), Some("persistent"));
}

#[test]
fn test_cyclic_graph_is_collected() {
    let mut vm = Vm::new();
    vm.collect_garbage();
    let baseline = vm.heap_live_count();

    // two lists referencing each other, reachable only from a global
    let a = vm.new_list(vec![]);
    let b = vm.new_list(vec![a]);
    let list_append = {
        let append = vm.getattr_by_name(a, "append").unwrap();
        vm.call_value(append, &[b]).unwrap();
        append
    };
    let _ = list_append;
    vm.set_global("cycle", a);
    vm.collect_garbage();
    assert!(vm.heap_live_count() > baseline);

    // dropping the global makes the whole cycle unreachable; a tracing
    // collector reclaims it in one pass
    vm.set_global("cycle", Value::NONE);
    vm.collect_garbage();
    assert_eq!(vm.heap_live_count(), baseline);
}

#[test]
fn test_heap_stats_report_shapes() {
    let mut vm = Vm::new();
    vm.collect_garbage();
    let before = vm.heap_stats();
    let _l = vm.new_list(vec![Value::new_int(1)]);
    let s = vm.new_str("x");
    vm.set_global("s", s);
    let after = vm.heap_stats();
    assert_eq!(after.live_objects, before.live_objects + 2);
    assert!(after.objects_by_type.contains_key("List"));
    assert!(after.objects_by_type.contains_key("Str"));
}

#[test]
fn test_gc_module_collect_is_callable() {
    let mut vm = Vm::new();
    let gc_module = vm.get_module("gc").unwrap();
    let collect = vm.getattr_by_name(gc_module, "collect").unwrap();
    let _warmup = vm.call_value(collect, &[]).unwrap();
    let freed = vm.call_value(collect, &[]).unwrap();
    assert_eq!(freed.as_int(), Some(0));
}
