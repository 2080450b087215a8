//! `repr` produces the canonical, re-parseable forms for the closed
//! round-trip set.

use pretty_assertions::assert_eq;
use pyxis::{Value, Vm};

fn repr_of(vm: &mut Vm, v: Value) -> String {
    vm.py_repr(v).unwrap()
}

#[test]
fn test_scalar_reprs() {
    let mut vm = Vm::new();
    assert_eq!(repr_of(&mut vm, Value::new_int(42)), "42");
    assert_eq!(repr_of(&mut vm, Value::new_int(-7)), "-7");
    assert_eq!(repr_of(&mut vm, Value::new_bool(true)), "True");
    assert_eq!(repr_of(&mut vm, Value::new_bool(false)), "False");
    assert_eq!(repr_of(&mut vm, Value::NONE), "None");
    assert_eq!(repr_of(&mut vm, Value::NOT_IMPLEMENTED), "NotImplemented");
}

#[test]
fn test_float_reprs_shortest_form() {
    let mut vm = Vm::new();
    assert_eq!(repr_of(&mut vm, Value::new_float(2.5)), "2.5");
    assert_eq!(repr_of(&mut vm, Value::new_float(1.0)), "1.0");
    assert_eq!(repr_of(&mut vm, Value::new_float(0.1)), "0.1");
    assert_eq!(repr_of(&mut vm, Value::new_float(f64::INFINITY)), "inf");
    assert_eq!(repr_of(&mut vm, Value::new_float(f64::NAN)), "nan");
}

#[test]
fn test_str_repr_quotes_and_escapes() {
    let mut vm = Vm::new();
    let s = vm.new_str("a'b\\c\nd");
    assert_eq!(repr_of(&mut vm, s), "'a\\'b\\\\c\\nd'");
    let plain = vm.new_str("plain");
    assert_eq!(repr_of(&mut vm, plain), "'plain'");
}

#[test]
fn test_container_reprs_recursive() {
    let mut vm = Vm::new();
    let s = vm.new_str("k");
    let tuple_single = vm.new_tuple(vec![Value::new_int(1)]);
    assert_eq!(repr_of(&mut vm, tuple_single), "(1,)");

    let inner = vm.new_tuple(vec![Value::new_int(1), Value::new_float(2.0)]);
    let list = vm.new_list(vec![inner, s]);
    assert_eq!(repr_of(&mut vm, list), "[(1, 2.0), 'k']");

    let dict = vm.new_dict();
    let key = vm.new_str("a");
    vm.dict_set(dict, key, Value::new_int(1)).unwrap();
    let key2 = vm.new_str("b");
    vm.dict_set(dict, key2, list).unwrap();
    assert_eq!(repr_of(&mut vm, dict), "{'a': 1, 'b': [(1, 2.0), 'k']}");
}

#[test]
fn test_vector_reprs() {
    let mut vm = Vm::new();
    assert_eq!(repr_of(&mut vm, Value::new_vec2(1.5, -2.0)), "vec2(1.5, -2)");
    assert_eq!(repr_of(&mut vm, Value::new_vec2i(3, -4)), "vec2i(3, -4)");
}

#[test]
fn test_repr_equality_follows_value_equality() {
    // values that compare equal print the same text for the closed set
    let mut vm = Vm::new();
    let a = vm.new_tuple(vec![Value::new_int(1), Value::new_int(2)]);
    let b = vm.new_tuple(vec![Value::new_int(1), Value::new_int(2)]);
    assert!(vm.py_eq(a, b).unwrap());
    let ra = repr_of(&mut vm, a);
    let rb = repr_of(&mut vm, b);
    assert_eq!(ra, rb);
}
