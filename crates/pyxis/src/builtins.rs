//! Registration of the built-in types and protocol functions.
//!
//! Each `register_*` function installs one type's magic slots and methods,
//! mirroring the dense low-range type ids declared in [`crate::types`].
//! Only protocol hooks and the functions the core itself consumes are
//! registered here; library modules are the host's business.

use strum::IntoEnumIterator;

use crate::{
    error::{ExcKind, RunError, RunResult},
    object::{ExcPayload, NativeFn, NativeFunc, ObjPayload},
    types::{self, MagicSlot, TypeId},
    value::Value,
    vm::Vm,
};

/// Registers every built-in type, the exception hierarchy, the `builtins`
/// and `__main__` modules, and the `gc` module. Called once from
/// `Vm::with_hooks`.
pub(crate) fn register(vm: &mut Vm) {
    register_core_types(vm);
    allocate_type_objects(vm);

    let builtins = vm.new_module("builtins");
    vm.builtins = builtins;
    let main = vm.new_module("__main__");
    vm.main = main;

    register_type(vm);
    register_int(vm);
    register_float(vm);
    register_bool(vm);
    register_singletons(vm);
    register_vec2(vm);
    register_vec2i(vm);
    register_str(vm);
    register_list(vm);
    register_tuple(vm);
    register_dict(vm);
    register_slice(vm);
    register_range(vm);
    register_iterators(vm);
    register_callables(vm);
    register_descriptors(vm);
    register_super(vm);
    register_module_type(vm);
    register_generator(vm);
    register_exceptions(vm);
    register_builtin_functions(vm);
    register_gc_module(vm);
    expose_types(vm);
}

/// Pushes the fixed type sequence; ids must line up with the `TP_*`
/// constants.
fn register_core_types(vm: &mut Vm) {
    let entries: &[(&str, TypeId, bool)] = &[
        ("nil", types::TP_NIL, true),
        ("object", types::TP_NIL, false),
        ("type", types::TP_OBJECT, true),
        ("int", types::TP_OBJECT, false), // sealed below, after bool derives it
        ("float", types::TP_OBJECT, true),
        ("bool", types::TP_INT, true),
        ("NoneType", types::TP_OBJECT, true),
        ("NotImplementedType", types::TP_OBJECT, true),
        ("vec2", types::TP_OBJECT, true),
        ("vec2i", types::TP_OBJECT, true),
        ("str", types::TP_OBJECT, true),
        ("list", types::TP_OBJECT, true),
        ("tuple", types::TP_OBJECT, true),
        ("dict", types::TP_OBJECT, true),
        ("slice", types::TP_OBJECT, true),
        ("range", types::TP_OBJECT, true),
        ("range_iterator", types::TP_OBJECT, true),
        ("array_iterator", types::TP_OBJECT, true),
        ("str_iterator", types::TP_OBJECT, true),
        ("function", types::TP_OBJECT, true),
        ("nativefunc", types::TP_OBJECT, true),
        ("boundmethod", types::TP_OBJECT, true),
        ("staticmethod", types::TP_OBJECT, true),
        ("classmethod", types::TP_OBJECT, true),
        ("property", types::TP_OBJECT, true),
        ("super", types::TP_OBJECT, true),
        ("module", types::TP_OBJECT, true),
        ("generator", types::TP_OBJECT, true),
    ];
    for (i, &(name, base, sealed)) in entries.iter().enumerate() {
        let name = vm.interns.intern(name);
        let id = vm
            .types
            .new_type(name, base, Value::NIL, None, false, sealed)
            .expect("core type registration cannot fail");
        assert_eq!(id.index(), i, "core type id drifted from its TP_* constant");
    }
    vm.types.get_mut(types::TP_INT).is_sealed = true;
}

/// Gives every registered type its type object (a boxed `TypeRef` with an
/// attribute dictionary for methods).
fn allocate_type_objects(vm: &mut Vm) {
    for i in 1..vm.types.len() {
        let tid = TypeId(u16::try_from(i).expect("type id fits u16"));
        let id = vm.heap.alloc_with_attrs(types::TP_TYPE, ObjPayload::TypeRef(tid));
        vm.types.get_mut(tid).self_value = Value::Boxed(types::TP_TYPE, id);
    }
}

// ----------------------------------------------------------------------
// Registration plumbing
// ----------------------------------------------------------------------

fn new_native(vm: &mut Vm, name: &'static str, func: NativeFn) -> Value {
    let id = vm
        .heap
        .alloc(types::TP_NATIVEFUNC, ObjPayload::NativeFunc(NativeFunc { name, func }));
    Value::Boxed(types::TP_NATIVEFUNC, id)
}

fn set_magic(vm: &mut Vm, t: TypeId, slot: MagicSlot, name: &'static str, func: NativeFn) {
    let f = new_native(vm, name, func);
    vm.types.get_mut(t).set_magic_slot(slot, f);
}

fn set_method(vm: &mut Vm, t: TypeId, name: &'static str, func: NativeFn) {
    let f = new_native(vm, name, func);
    let n = vm.interns.intern(name);
    let id = vm.types.get(t).self_value.as_obj().expect("type object is boxed");
    vm.heap.attrs_mut(id).set(n, f);
}

fn set_property(vm: &mut Vm, t: TypeId, name: &'static str, getter_name: &'static str, getter: NativeFn) {
    let g = new_native(vm, getter_name, getter);
    let id = vm.heap.alloc(
        types::TP_PROPERTY,
        ObjPayload::Property {
            getter: g,
            setter: Value::NIL,
        },
    );
    let prop = Value::Boxed(types::TP_PROPERTY, id);
    let n = vm.interns.intern(name);
    let type_obj = vm.types.get(t).self_value.as_obj().expect("type object is boxed");
    vm.heap.attrs_mut(type_obj).set(n, prop);
}

fn set_builtin(vm: &mut Vm, name: &'static str, func: NativeFn) {
    let f = new_native(vm, name, func);
    let n = vm.interns.intern(name);
    let builtins = vm.builtins;
    vm.set_module_attr(builtins, n, f);
}

fn no_kwargs(name: &str, kwargc: usize) -> RunResult<()> {
    if kwargc != 0 {
        return Err(RunError::type_error(format!("{name}() takes no keyword arguments")));
    }
    Ok(())
}

fn check_argc(name: &str, argc: usize, expected: usize) -> RunResult<()> {
    if argc != expected {
        return Err(RunError::type_error(format!(
            "{name}() takes {expected} arguments, got {argc}"
        )));
    }
    Ok(())
}

/// Normalises a possibly negative index against a length.
fn normalize_index(index: i64, len: usize) -> RunResult<usize> {
    let len = i64::try_from(len).expect("length fits i64");
    let adjusted = if index < 0 { index + len } else { index };
    if adjusted < 0 || adjusted >= len {
        return Err(RunError::index_error("index out of range"));
    }
    Ok(usize::try_from(adjusted).expect("normalized index is non-negative"))
}

/// Resolves a slice object against a length into `(start, stop, step)`.
fn parse_slice(vm: &Vm, slice: Value, len: usize) -> RunResult<(i64, i64, i64)> {
    let Some(id) = slice.as_obj() else {
        return Err(RunError::type_error("expected a slice"));
    };
    let ObjPayload::Slice { start, stop, step } = vm.heap.payload(id) else {
        return Err(RunError::type_error("expected a slice"));
    };
    let (start, stop, step) = (*start, *stop, *step);
    let len = i64::try_from(len).expect("length fits i64");
    let step = match step.as_index() {
        Some(0) => return Err(RunError::value_error("slice step cannot be zero")),
        Some(s) => s,
        None if step.is_none() => 1,
        None => return Err(RunError::type_error("slice indices must be integers")),
    };
    let resolve = |v: Value, default: i64, low: i64, high: i64| -> RunResult<i64> {
        match v.as_index() {
            Some(mut x) => {
                if x < 0 {
                    x += len;
                }
                Ok(x.clamp(low, high))
            }
            None if v.is_none() => Ok(default),
            None => Err(RunError::type_error("slice indices must be integers")),
        }
    };
    let (start, stop) = if step > 0 {
        (resolve(start, 0, 0, len)?, resolve(stop, len, 0, len)?)
    } else {
        (resolve(start, len - 1, -1, len - 1)?, resolve(stop, -1, -1, len)?)
    };
    Ok((start, stop, step))
}

fn iter_slice_indices(start: i64, stop: i64, step: i64) -> Vec<usize> {
    let mut out = Vec::new();
    let mut i = start;
    if step > 0 {
        while i < stop {
            out.push(usize::try_from(i).expect("slice index is non-negative"));
            i += step;
        }
    } else {
        while i > stop {
            out.push(usize::try_from(i).expect("slice index is non-negative"));
            i += step;
        }
    }
    out
}

/// Reads the items of a list or tuple payload.
fn sequence_items(vm: &Vm, v: Value) -> Option<Vec<Value>> {
    match v.as_obj().map(|id| vm.heap.payload(id)) {
        Some(ObjPayload::List(items)) => Some(items.clone()),
        Some(ObjPayload::Tuple(items)) => Some(items.to_vec()),
        _ => None,
    }
}

/// Quotes a string the way `repr` does.
fn quote_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Formats a float the way `repr` does (shortest round-trip form).
fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_owned() } else { "-inf".to_owned() };
    }
    let mut buf = ryu::Buffer::new();
    buf.format(f).to_owned()
}

// ----------------------------------------------------------------------
// type
// ----------------------------------------------------------------------

fn register_type(vm: &mut Vm) {
    // `type(x)` answers through the constructor slot
    set_magic(vm, types::TP_TYPE, MagicSlot::New, "type", |vm, argc, kwargc| {
        no_kwargs("type", kwargc)?;
        check_argc("type", argc, 2)?;
        let v = vm.arg(1);
        vm.retval = vm.types.get(v.type_of()).self_value;
        Ok(())
    });
    set_magic(vm, types::TP_TYPE, MagicSlot::Repr, "type.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let tid = vm
            .as_type_id(vm.arg(0))
            .ok_or_else(|| RunError::type_error("__repr__ expects a type"))?;
        let text = format!("<class '{}'>", vm.type_name(tid));
        vm.retval = vm.new_str(&text);
        Ok(())
    });
}

// ----------------------------------------------------------------------
// int
// ----------------------------------------------------------------------

/// Shared shape of the int binary slots: int/bool operands participate,
/// anything else defers to the reflected slot via `NotImplemented`.
fn int_arith(vm: &mut Vm, argc: usize, name: &str, op: fn(i64, i64) -> RunResult<Value>) -> RunResult<()> {
    check_argc(name, argc, 2)?;
    let lhs = vm
        .arg(0)
        .as_index()
        .ok_or_else(|| RunError::type_error("descriptor requires an int receiver"))?;
    match vm.arg(1).as_index() {
        Some(rhs) => {
            vm.retval = op(lhs, rhs)?;
            Ok(())
        }
        None => {
            vm.retval = Value::NOT_IMPLEMENTED;
            Ok(())
        }
    }
}

/// Numeric comparison shared by int and float slots: compares as `f64`
/// when either side is a float.
fn num_compare(vm: &mut Vm, argc: usize, name: &str, cmp: fn(f64, f64) -> bool) -> RunResult<()> {
    check_argc(name, argc, 2)?;
    let (Some(a), Some(b)) = (vm.arg(0).as_number(), vm.arg(1).as_number()) else {
        vm.retval = Value::NOT_IMPLEMENTED;
        return Ok(());
    };
    vm.retval = Value::new_bool(cmp(a, b));
    Ok(())
}

fn register_int(vm: &mut Vm) {
    set_magic(vm, types::TP_INT, MagicSlot::New, "int", |vm, argc, kwargc| {
        no_kwargs("int", kwargc)?;
        if argc == 1 {
            vm.retval = Value::new_int(0);
            return Ok(());
        }
        check_argc("int", argc, 2)?;
        let v = vm.arg(1);
        if let Some(i) = v.as_index() {
            vm.retval = Value::new_int(i);
        } else if let Some(f) = v.as_float() {
            vm.retval = Value::new_int(f.trunc() as i64);
        } else if let Some(s) = vm.str_of(v) {
            let parsed: i64 = s
                .trim()
                .parse()
                .map_err(|_| RunError::value_error(format!("invalid literal for int(): {}", quote_str(s))))?;
            vm.retval = Value::new_int(parsed);
        } else {
            return Err(RunError::type_error("int() argument must be a string or a number"));
        }
        Ok(())
    });

    set_magic(vm, types::TP_INT, MagicSlot::Add, "int.__add__", |vm, argc, _| {
        int_arith(vm, argc, "__add__", |a, b| {
            a.checked_add(b)
                .map(Value::new_int)
                .ok_or_else(|| RunError::overflow("integer addition overflow"))
        })
    });
    set_magic(vm, types::TP_INT, MagicSlot::Sub, "int.__sub__", |vm, argc, _| {
        int_arith(vm, argc, "__sub__", |a, b| {
            a.checked_sub(b)
                .map(Value::new_int)
                .ok_or_else(|| RunError::overflow("integer subtraction overflow"))
        })
    });
    set_magic(vm, types::TP_INT, MagicSlot::Mul, "int.__mul__", |vm, argc, _| {
        int_arith(vm, argc, "__mul__", |a, b| {
            a.checked_mul(b)
                .map(Value::new_int)
                .ok_or_else(|| RunError::overflow("integer multiplication overflow"))
        })
    });
    set_magic(vm, types::TP_INT, MagicSlot::FloorDiv, "int.__floordiv__", |vm, argc, _| {
        int_arith(vm, argc, "__floordiv__", |a, b| {
            if b == 0 {
                return Err(RunError::zero_division("integer division or modulo by zero"));
            }
            let mut q = a.wrapping_div(b);
            let r = a.wrapping_rem(b);
            if r != 0 && (r < 0) != (b < 0) {
                q -= 1;
            }
            Ok(Value::new_int(q))
        })
    });
    set_magic(vm, types::TP_INT, MagicSlot::Mod, "int.__mod__", |vm, argc, _| {
        int_arith(vm, argc, "__mod__", |a, b| {
            if b == 0 {
                return Err(RunError::zero_division("integer division or modulo by zero"));
            }
            let mut r = a.wrapping_rem(b);
            if r != 0 && (r < 0) != (b < 0) {
                r += b;
            }
            Ok(Value::new_int(r))
        })
    });
    set_magic(vm, types::TP_INT, MagicSlot::TrueDiv, "int.__truediv__", |vm, argc, _| {
        int_arith(vm, argc, "__truediv__", |a, b| {
            if b == 0 {
                return Err(RunError::zero_division("division by zero"));
            }
            Ok(Value::new_float(a as f64 / b as f64))
        })
    });
    set_magic(vm, types::TP_INT, MagicSlot::Pow, "int.__pow__", |vm, argc, _| {
        int_arith(vm, argc, "__pow__", |a, b| {
            if b < 0 {
                return Ok(Value::new_float((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| RunError::overflow("integer power overflow"))?;
            a.checked_pow(exp)
                .map(Value::new_int)
                .ok_or_else(|| RunError::overflow("integer power overflow"))
        })
    });
    set_magic(vm, types::TP_INT, MagicSlot::And, "int.__and__", |vm, argc, _| {
        int_arith(vm, argc, "__and__", |a, b| Ok(Value::new_int(a & b)))
    });
    set_magic(vm, types::TP_INT, MagicSlot::Or, "int.__or__", |vm, argc, _| {
        int_arith(vm, argc, "__or__", |a, b| Ok(Value::new_int(a | b)))
    });
    set_magic(vm, types::TP_INT, MagicSlot::Xor, "int.__xor__", |vm, argc, _| {
        int_arith(vm, argc, "__xor__", |a, b| Ok(Value::new_int(a ^ b)))
    });
    set_magic(vm, types::TP_INT, MagicSlot::Lshift, "int.__lshift__", |vm, argc, _| {
        int_arith(vm, argc, "__lshift__", |a, b| {
            let shift = u32::try_from(b).map_err(|_| RunError::value_error("negative shift count"))?;
            a.checked_shl(shift)
                .filter(|r| (r >> shift) == a)
                .map(Value::new_int)
                .ok_or_else(|| RunError::overflow("shifted value too large"))
        })
    });
    set_magic(vm, types::TP_INT, MagicSlot::Rshift, "int.__rshift__", |vm, argc, _| {
        int_arith(vm, argc, "__rshift__", |a, b| {
            let shift = u32::try_from(b).map_err(|_| RunError::value_error("negative shift count"))?;
            Ok(Value::new_int(a.checked_shr(shift).unwrap_or(if a < 0 { -1 } else { 0 })))
        })
    });

    set_magic(vm, types::TP_INT, MagicSlot::Lt, "int.__lt__", |vm, argc, _| {
        num_compare(vm, argc, "__lt__", |a, b| a < b)
    });
    set_magic(vm, types::TP_INT, MagicSlot::Le, "int.__le__", |vm, argc, _| {
        num_compare(vm, argc, "__le__", |a, b| a <= b)
    });
    set_magic(vm, types::TP_INT, MagicSlot::Gt, "int.__gt__", |vm, argc, _| {
        num_compare(vm, argc, "__gt__", |a, b| a > b)
    });
    set_magic(vm, types::TP_INT, MagicSlot::Ge, "int.__ge__", |vm, argc, _| {
        num_compare(vm, argc, "__ge__", |a, b| a >= b)
    });
    set_magic(vm, types::TP_INT, MagicSlot::Repr, "int.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let i = vm.arg(0).as_index().ok_or_else(|| RunError::type_error("expected int"))?;
        vm.retval = vm.new_str(&i.to_string());
        Ok(())
    });
    set_magic(vm, types::TP_INT, MagicSlot::Abs, "int.__abs__", |vm, argc, _| {
        check_argc("__abs__", argc, 1)?;
        let i = vm.arg(0).as_index().ok_or_else(|| RunError::type_error("expected int"))?;
        vm.retval = i
            .checked_abs()
            .map(Value::new_int)
            .ok_or_else(|| RunError::overflow("integer negation overflow"))?;
        Ok(())
    });
}

// ----------------------------------------------------------------------
// float
// ----------------------------------------------------------------------

/// Shared shape of the float binary slots; the receiver may be on either
/// side for the reflected variants.
fn float_arith(vm: &mut Vm, argc: usize, name: &str, reflected: bool, op: fn(f64, f64) -> RunResult<Value>) -> RunResult<()> {
    check_argc(name, argc, 2)?;
    let (Some(a), Some(b)) = (vm.arg(0).as_number(), vm.arg(1).as_number()) else {
        vm.retval = Value::NOT_IMPLEMENTED;
        return Ok(());
    };
    vm.retval = if reflected { op(b, a)? } else { op(a, b)? };
    Ok(())
}

fn float_floordiv(a: f64, b: f64) -> RunResult<Value> {
    if b == 0.0 {
        return Err(RunError::zero_division("float floor division by zero"));
    }
    Ok(Value::new_float((a / b).floor()))
}

fn float_mod(a: f64, b: f64) -> RunResult<Value> {
    if b == 0.0 {
        return Err(RunError::zero_division("float modulo"));
    }
    Ok(Value::new_float(a - b * (a / b).floor()))
}

fn float_truediv(a: f64, b: f64) -> RunResult<Value> {
    if b == 0.0 {
        return Err(RunError::zero_division("float division by zero"));
    }
    Ok(Value::new_float(a / b))
}

fn register_float(vm: &mut Vm) {
    set_magic(vm, types::TP_FLOAT, MagicSlot::New, "float", |vm, argc, kwargc| {
        no_kwargs("float", kwargc)?;
        if argc == 1 {
            vm.retval = Value::new_float(0.0);
            return Ok(());
        }
        check_argc("float", argc, 2)?;
        let v = vm.arg(1);
        if let Some(f) = v.as_number() {
            vm.retval = Value::new_float(f);
        } else if let Some(s) = vm.str_of(v) {
            let parsed: f64 = s
                .trim()
                .parse()
                .map_err(|_| RunError::value_error(format!("could not convert string to float: {}", quote_str(s))))?;
            vm.retval = Value::new_float(parsed);
        } else {
            return Err(RunError::type_error("float() argument must be a string or a number"));
        }
        Ok(())
    });

    set_magic(vm, types::TP_FLOAT, MagicSlot::Add, "float.__add__", |vm, argc, _| {
        float_arith(vm, argc, "__add__", false, |a, b| Ok(Value::new_float(a + b)))
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Radd, "float.__radd__", |vm, argc, _| {
        float_arith(vm, argc, "__radd__", true, |a, b| Ok(Value::new_float(a + b)))
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Sub, "float.__sub__", |vm, argc, _| {
        float_arith(vm, argc, "__sub__", false, |a, b| Ok(Value::new_float(a - b)))
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Rsub, "float.__rsub__", |vm, argc, _| {
        float_arith(vm, argc, "__rsub__", true, |a, b| Ok(Value::new_float(a - b)))
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Mul, "float.__mul__", |vm, argc, _| {
        float_arith(vm, argc, "__mul__", false, |a, b| Ok(Value::new_float(a * b)))
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Rmul, "float.__rmul__", |vm, argc, _| {
        float_arith(vm, argc, "__rmul__", true, |a, b| Ok(Value::new_float(a * b)))
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::TrueDiv, "float.__truediv__", |vm, argc, _| {
        float_arith(vm, argc, "__truediv__", false, float_truediv)
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::RTrueDiv, "float.__rtruediv__", |vm, argc, _| {
        float_arith(vm, argc, "__rtruediv__", true, float_truediv)
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::FloorDiv, "float.__floordiv__", |vm, argc, _| {
        float_arith(vm, argc, "__floordiv__", false, float_floordiv)
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::RFloorDiv, "float.__rfloordiv__", |vm, argc, _| {
        float_arith(vm, argc, "__rfloordiv__", true, float_floordiv)
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Mod, "float.__mod__", |vm, argc, _| {
        float_arith(vm, argc, "__mod__", false, float_mod)
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Rmod, "float.__rmod__", |vm, argc, _| {
        float_arith(vm, argc, "__rmod__", true, float_mod)
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Pow, "float.__pow__", |vm, argc, _| {
        float_arith(vm, argc, "__pow__", false, |a, b| Ok(Value::new_float(a.powf(b))))
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Rpow, "float.__rpow__", |vm, argc, _| {
        float_arith(vm, argc, "__rpow__", true, |a, b| Ok(Value::new_float(a.powf(b))))
    });

    set_magic(vm, types::TP_FLOAT, MagicSlot::Lt, "float.__lt__", |vm, argc, _| {
        num_compare(vm, argc, "__lt__", |a, b| a < b)
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Le, "float.__le__", |vm, argc, _| {
        num_compare(vm, argc, "__le__", |a, b| a <= b)
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Gt, "float.__gt__", |vm, argc, _| {
        num_compare(vm, argc, "__gt__", |a, b| a > b)
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Ge, "float.__ge__", |vm, argc, _| {
        num_compare(vm, argc, "__ge__", |a, b| a >= b)
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Repr, "float.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let f = vm.arg(0).as_float().ok_or_else(|| RunError::type_error("expected float"))?;
        let text = format_float(f);
        vm.retval = vm.new_str(&text);
        Ok(())
    });
    set_magic(vm, types::TP_FLOAT, MagicSlot::Abs, "float.__abs__", |vm, argc, _| {
        check_argc("__abs__", argc, 1)?;
        let f = vm.arg(0).as_float().ok_or_else(|| RunError::type_error("expected float"))?;
        vm.retval = Value::new_float(f.abs());
        Ok(())
    });
}

// ----------------------------------------------------------------------
// bool and the inline singletons
// ----------------------------------------------------------------------

fn register_bool(vm: &mut Vm) {
    // bool was registered before int's slots existed; re-copy, then
    // override the parts that differ
    let int_magic = vm.types.get(types::TP_INT).magic;
    vm.types.get_mut(types::TP_BOOL).magic = int_magic;

    set_magic(vm, types::TP_BOOL, MagicSlot::New, "bool", |vm, argc, kwargc| {
        no_kwargs("bool", kwargc)?;
        if argc == 1 {
            vm.retval = Value::new_bool(false);
            return Ok(());
        }
        check_argc("bool", argc, 2)?;
        let v = vm.arg(1);
        let b = vm.py_bool(v)?;
        vm.retval = Value::new_bool(b);
        Ok(())
    });
    set_magic(vm, types::TP_BOOL, MagicSlot::Repr, "bool.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let b = vm.arg(0).as_bool().ok_or_else(|| RunError::type_error("expected bool"))?;
        vm.retval = vm.new_str(if b { "True" } else { "False" });
        Ok(())
    });
}

fn register_singletons(vm: &mut Vm) {
    set_magic(vm, types::TP_NONE, MagicSlot::Repr, "NoneType.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        vm.retval = vm.new_str("None");
        Ok(())
    });
    set_magic(
        vm,
        types::TP_NOT_IMPLEMENTED,
        MagicSlot::Repr,
        "NotImplementedType.__repr__",
        |vm, argc, _| {
            check_argc("__repr__", argc, 1)?;
            vm.retval = vm.new_str("NotImplemented");
            Ok(())
        },
    );
}

// ----------------------------------------------------------------------
// 2-vectors
// ----------------------------------------------------------------------

fn vec2_of(v: Value) -> Option<(f32, f32)> {
    match v {
        Value::Inline(t, s) if t == types::TP_VEC2 => Some(s.as_vec2()),
        _ => None,
    }
}

fn vec2i_of(v: Value) -> Option<(i32, i32)> {
    match v {
        Value::Inline(t, s) if t == types::TP_VEC2I => Some(s.as_vec2i()),
        _ => None,
    }
}

fn register_vec2(vm: &mut Vm) {
    set_magic(vm, types::TP_VEC2, MagicSlot::New, "vec2", |vm, argc, kwargc| {
        no_kwargs("vec2", kwargc)?;
        check_argc("vec2", argc, 3)?;
        let x = vm.arg(1).as_number().ok_or_else(|| RunError::type_error("vec2 components must be numbers"))?;
        let y = vm.arg(2).as_number().ok_or_else(|| RunError::type_error("vec2 components must be numbers"))?;
        vm.retval = Value::new_vec2(x as f32, y as f32);
        Ok(())
    });
    set_magic(vm, types::TP_VEC2, MagicSlot::Add, "vec2.__add__", |vm, argc, _| {
        check_argc("__add__", argc, 2)?;
        match (vec2_of(vm.arg(0)), vec2_of(vm.arg(1))) {
            (Some((ax, ay)), Some((bx, by))) => {
                vm.retval = Value::new_vec2(ax + bx, ay + by);
                Ok(())
            }
            _ => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_VEC2, MagicSlot::Sub, "vec2.__sub__", |vm, argc, _| {
        check_argc("__sub__", argc, 2)?;
        match (vec2_of(vm.arg(0)), vec2_of(vm.arg(1))) {
            (Some((ax, ay)), Some((bx, by))) => {
                vm.retval = Value::new_vec2(ax - bx, ay - by);
                Ok(())
            }
            _ => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_VEC2, MagicSlot::Mul, "vec2.__mul__", |vm, argc, _| {
        check_argc("__mul__", argc, 2)?;
        let lhs = vec2_of(vm.arg(0));
        let scalar = vm.arg(1).as_number();
        match (lhs, scalar) {
            (Some((x, y)), Some(k)) => {
                vm.retval = Value::new_vec2(x * k as f32, y * k as f32);
                Ok(())
            }
            _ => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_VEC2, MagicSlot::Eq, "vec2.__eq__", |vm, argc, _| {
        check_argc("__eq__", argc, 2)?;
        match (vec2_of(vm.arg(0)), vec2_of(vm.arg(1))) {
            (Some(a), Some(b)) => {
                vm.retval = Value::new_bool(a == b);
                Ok(())
            }
            _ => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_VEC2, MagicSlot::Repr, "vec2.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let (x, y) = vec2_of(vm.arg(0)).ok_or_else(|| RunError::type_error("expected vec2"))?;
        let text = format!("vec2({x}, {y})");
        vm.retval = vm.new_str(&text);
        Ok(())
    });
    set_property(vm, types::TP_VEC2, "x", "vec2.x", |vm, argc, _| {
        check_argc("x", argc, 1)?;
        let (x, _) = vec2_of(vm.arg(0)).ok_or_else(|| RunError::type_error("expected vec2"))?;
        vm.retval = Value::new_float(f64::from(x));
        Ok(())
    });
    set_property(vm, types::TP_VEC2, "y", "vec2.y", |vm, argc, _| {
        check_argc("y", argc, 1)?;
        let (_, y) = vec2_of(vm.arg(0)).ok_or_else(|| RunError::type_error("expected vec2"))?;
        vm.retval = Value::new_float(f64::from(y));
        Ok(())
    });
}

fn register_vec2i(vm: &mut Vm) {
    set_magic(vm, types::TP_VEC2I, MagicSlot::New, "vec2i", |vm, argc, kwargc| {
        no_kwargs("vec2i", kwargc)?;
        check_argc("vec2i", argc, 3)?;
        let x = vm.arg(1).as_index().ok_or_else(|| RunError::type_error("vec2i components must be integers"))?;
        let y = vm.arg(2).as_index().ok_or_else(|| RunError::type_error("vec2i components must be integers"))?;
        let x = i32::try_from(x).map_err(|_| RunError::overflow("vec2i component out of range"))?;
        let y = i32::try_from(y).map_err(|_| RunError::overflow("vec2i component out of range"))?;
        vm.retval = Value::new_vec2i(x, y);
        Ok(())
    });
    set_magic(vm, types::TP_VEC2I, MagicSlot::Add, "vec2i.__add__", |vm, argc, _| {
        check_argc("__add__", argc, 2)?;
        match (vec2i_of(vm.arg(0)), vec2i_of(vm.arg(1))) {
            (Some((ax, ay)), Some((bx, by))) => {
                vm.retval = Value::new_vec2i(ax.wrapping_add(bx), ay.wrapping_add(by));
                Ok(())
            }
            _ => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_VEC2I, MagicSlot::Sub, "vec2i.__sub__", |vm, argc, _| {
        check_argc("__sub__", argc, 2)?;
        match (vec2i_of(vm.arg(0)), vec2i_of(vm.arg(1))) {
            (Some((ax, ay)), Some((bx, by))) => {
                vm.retval = Value::new_vec2i(ax.wrapping_sub(bx), ay.wrapping_sub(by));
                Ok(())
            }
            _ => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_VEC2I, MagicSlot::Eq, "vec2i.__eq__", |vm, argc, _| {
        check_argc("__eq__", argc, 2)?;
        match (vec2i_of(vm.arg(0)), vec2i_of(vm.arg(1))) {
            (Some(a), Some(b)) => {
                vm.retval = Value::new_bool(a == b);
                Ok(())
            }
            _ => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_VEC2I, MagicSlot::Repr, "vec2i.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let (x, y) = vec2i_of(vm.arg(0)).ok_or_else(|| RunError::type_error("expected vec2i"))?;
        let text = format!("vec2i({x}, {y})");
        vm.retval = vm.new_str(&text);
        Ok(())
    });
    set_property(vm, types::TP_VEC2I, "x", "vec2i.x", |vm, argc, _| {
        check_argc("x", argc, 1)?;
        let (x, _) = vec2i_of(vm.arg(0)).ok_or_else(|| RunError::type_error("expected vec2i"))?;
        vm.retval = Value::new_int(i64::from(x));
        Ok(())
    });
    set_property(vm, types::TP_VEC2I, "y", "vec2i.y", |vm, argc, _| {
        check_argc("y", argc, 1)?;
        let (_, y) = vec2i_of(vm.arg(0)).ok_or_else(|| RunError::type_error("expected vec2i"))?;
        vm.retval = Value::new_int(i64::from(y));
        Ok(())
    });
}

// ----------------------------------------------------------------------
// str
// ----------------------------------------------------------------------

fn arg_str(vm: &Vm, i: usize) -> RunResult<String> {
    vm.str_of(vm.arg(i))
        .map(str::to_owned)
        .ok_or_else(|| RunError::type_error("expected str"))
}

fn register_str(vm: &mut Vm) {
    set_magic(vm, types::TP_STR, MagicSlot::New, "str", |vm, argc, kwargc| {
        no_kwargs("str", kwargc)?;
        if argc == 1 {
            vm.retval = vm.new_str("");
            return Ok(());
        }
        check_argc("str", argc, 2)?;
        let v = vm.arg(1);
        let text = vm.py_str(v)?;
        vm.retval = vm.new_str(&text);
        Ok(())
    });
    set_magic(vm, types::TP_STR, MagicSlot::Add, "str.__add__", |vm, argc, _| {
        check_argc("__add__", argc, 2)?;
        let a = arg_str(vm, 0)?;
        match vm.str_of(vm.arg(1)) {
            Some(b) => {
                let joined = format!("{a}{b}");
                vm.retval = vm.new_str(&joined);
                Ok(())
            }
            None => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_STR, MagicSlot::Mul, "str.__mul__", |vm, argc, _| {
        check_argc("__mul__", argc, 2)?;
        let a = arg_str(vm, 0)?;
        match vm.arg(1).as_index() {
            Some(n) => {
                let n = usize::try_from(n.max(0)).expect("non-negative repeat");
                let repeated = a.repeat(n);
                vm.retval = vm.new_str(&repeated);
                Ok(())
            }
            None => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_STR, MagicSlot::Eq, "str.__eq__", |vm, argc, _| {
        check_argc("__eq__", argc, 2)?;
        let a = arg_str(vm, 0)?;
        match vm.str_of(vm.arg(1)) {
            Some(b) => {
                vm.retval = Value::new_bool(a == b);
                Ok(())
            }
            None => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_STR, MagicSlot::Lt, "str.__lt__", |vm, argc, _| {
        check_argc("__lt__", argc, 2)?;
        let a = arg_str(vm, 0)?;
        match vm.str_of(vm.arg(1)) {
            Some(b) => {
                vm.retval = Value::new_bool(a.as_str() < b);
                Ok(())
            }
            None => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_STR, MagicSlot::Le, "str.__le__", |vm, argc, _| {
        check_argc("__le__", argc, 2)?;
        let a = arg_str(vm, 0)?;
        match vm.str_of(vm.arg(1)) {
            Some(b) => {
                vm.retval = Value::new_bool(a.as_str() <= b);
                Ok(())
            }
            None => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_STR, MagicSlot::Gt, "str.__gt__", |vm, argc, _| {
        check_argc("__gt__", argc, 2)?;
        let a = arg_str(vm, 0)?;
        match vm.str_of(vm.arg(1)) {
            Some(b) => {
                vm.retval = Value::new_bool(a.as_str() > b);
                Ok(())
            }
            None => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_STR, MagicSlot::Ge, "str.__ge__", |vm, argc, _| {
        check_argc("__ge__", argc, 2)?;
        let a = arg_str(vm, 0)?;
        match vm.str_of(vm.arg(1)) {
            Some(b) => {
                vm.retval = Value::new_bool(a.as_str() >= b);
                Ok(())
            }
            None => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_STR, MagicSlot::Len, "str.__len__", |vm, argc, _| {
        check_argc("__len__", argc, 1)?;
        let s = arg_str(vm, 0)?;
        vm.retval = Value::new_int(i64::try_from(s.chars().count()).expect("length fits i64"));
        Ok(())
    });
    set_magic(vm, types::TP_STR, MagicSlot::Contains, "str.__contains__", |vm, argc, _| {
        check_argc("__contains__", argc, 2)?;
        let hay = arg_str(vm, 0)?;
        let needle = arg_str(vm, 1)?;
        vm.retval = Value::new_bool(hay.contains(&needle));
        Ok(())
    });
    set_magic(vm, types::TP_STR, MagicSlot::GetItem, "str.__getitem__", |vm, argc, _| {
        check_argc("__getitem__", argc, 2)?;
        let s = arg_str(vm, 0)?;
        let key = vm.arg(1);
        let chars: Vec<char> = s.chars().collect();
        if let Some(i) = key.as_index() {
            let idx = normalize_index(i, chars.len()).map_err(|_| RunError::index_error("string index out of range"))?;
            let text = chars[idx].to_string();
            vm.retval = vm.new_str(&text);
            return Ok(());
        }
        if key.type_of() == types::TP_SLICE {
            let (start, stop, step) = parse_slice(vm, key, chars.len())?;
            let text: String = iter_slice_indices(start, stop, step).into_iter().map(|i| chars[i]).collect();
            vm.retval = vm.new_str(&text);
            return Ok(());
        }
        Err(RunError::type_error("string indices must be integers or slices"))
    });
    set_magic(vm, types::TP_STR, MagicSlot::Iter, "str.__iter__", |vm, argc, _| {
        check_argc("__iter__", argc, 1)?;
        let s = vm.arg(0);
        let id = vm.heap.alloc(types::TP_STR_ITERATOR, ObjPayload::StrIterator { s, index: 0 });
        vm.retval = Value::Boxed(types::TP_STR_ITERATOR, id);
        Ok(())
    });
    set_magic(vm, types::TP_STR, MagicSlot::Repr, "str.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let s = arg_str(vm, 0)?;
        let quoted = quote_str(&s);
        vm.retval = vm.new_str(&quoted);
        Ok(())
    });
}

// ----------------------------------------------------------------------
// list / tuple
// ----------------------------------------------------------------------

fn list_items_mut(vm: &mut Vm, v: Value) -> RunResult<&mut Vec<Value>> {
    let Some(id) = v.as_obj() else {
        return Err(RunError::type_error("expected list"));
    };
    match vm.heap.payload_mut(id) {
        ObjPayload::List(items) => Ok(items),
        _ => Err(RunError::type_error("expected list")),
    }
}

/// Elementwise equality shared by list and tuple `__eq__`.
fn sequence_eq(vm: &mut Vm, argc: usize, want: TypeId) -> RunResult<()> {
    check_argc("__eq__", argc, 2)?;
    let lhs = vm.arg(0);
    let rhs = vm.arg(1);
    if rhs.type_of() != want {
        vm.retval = Value::NOT_IMPLEMENTED;
        return Ok(());
    }
    let (Some(a), Some(b)) = (sequence_items(vm, lhs), sequence_items(vm, rhs)) else {
        vm.retval = Value::NOT_IMPLEMENTED;
        return Ok(());
    };
    if a.len() != b.len() {
        vm.retval = Value::new_bool(false);
        return Ok(());
    }
    for (x, y) in a.into_iter().zip(b) {
        if !vm.py_eq(x, y)? {
            vm.retval = Value::new_bool(false);
            return Ok(());
        }
    }
    vm.retval = Value::new_bool(true);
    Ok(())
}

/// Shared repr for the two array shapes.
fn sequence_repr(vm: &mut Vm, items: &[Value], open: char, close: char, trailing_comma: bool) -> RunResult<Value> {
    let mut out = String::new();
    out.push(open);
    for (i, &item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&vm.py_repr(item)?);
    }
    if trailing_comma && items.len() == 1 {
        out.push(',');
    }
    out.push(close);
    Ok(vm.new_str(&out))
}

fn array_iterator_over(vm: &mut Vm, seq: Value) -> Value {
    let id = vm.heap.alloc(types::TP_ARRAY_ITERATOR, ObjPayload::ArrayIterator { seq, index: 0 });
    Value::Boxed(types::TP_ARRAY_ITERATOR, id)
}

fn register_list(vm: &mut Vm) {
    set_magic(vm, types::TP_LIST, MagicSlot::New, "list", |vm, argc, kwargc| {
        no_kwargs("list", kwargc)?;
        if argc == 1 {
            vm.retval = vm.new_list(Vec::new());
            return Ok(());
        }
        check_argc("list", argc, 2)?;
        let src = vm.arg(1);
        let items = vm.iter_to_vec(src)?;
        vm.retval = vm.new_list(items);
        Ok(())
    });
    set_magic(vm, types::TP_LIST, MagicSlot::Len, "list.__len__", |vm, argc, _| {
        check_argc("__len__", argc, 1)?;
        let items = sequence_items(vm, vm.arg(0)).ok_or_else(|| RunError::type_error("expected list"))?;
        vm.retval = Value::new_int(i64::try_from(items.len()).expect("length fits i64"));
        Ok(())
    });
    set_magic(vm, types::TP_LIST, MagicSlot::GetItem, "list.__getitem__", |vm, argc, _| {
        check_argc("__getitem__", argc, 2)?;
        let items = sequence_items(vm, vm.arg(0)).ok_or_else(|| RunError::type_error("expected list"))?;
        let key = vm.arg(1);
        if let Some(i) = key.as_index() {
            let idx = normalize_index(i, items.len()).map_err(|_| RunError::index_error("list index out of range"))?;
            vm.retval = items[idx];
            return Ok(());
        }
        if key.type_of() == types::TP_SLICE {
            let (start, stop, step) = parse_slice(vm, key, items.len())?;
            let picked: Vec<Value> = iter_slice_indices(start, stop, step).into_iter().map(|i| items[i]).collect();
            vm.retval = vm.new_list(picked);
            return Ok(());
        }
        Err(RunError::type_error("list indices must be integers or slices"))
    });
    set_magic(vm, types::TP_LIST, MagicSlot::SetItem, "list.__setitem__", |vm, argc, _| {
        check_argc("__setitem__", argc, 3)?;
        let target = vm.arg(0);
        let i = vm
            .arg(1)
            .as_index()
            .ok_or_else(|| RunError::type_error("list indices must be integers"))?;
        let value = vm.arg(2);
        let items = list_items_mut(vm, target)?;
        let idx = normalize_index(i, items.len()).map_err(|_| RunError::index_error("list assignment index out of range"))?;
        items[idx] = value;
        vm.retval = Value::NONE;
        Ok(())
    });
    set_magic(vm, types::TP_LIST, MagicSlot::DelItem, "list.__delitem__", |vm, argc, _| {
        check_argc("__delitem__", argc, 2)?;
        let target = vm.arg(0);
        let i = vm
            .arg(1)
            .as_index()
            .ok_or_else(|| RunError::type_error("list indices must be integers"))?;
        let items = list_items_mut(vm, target)?;
        let idx = normalize_index(i, items.len()).map_err(|_| RunError::index_error("list index out of range"))?;
        items.remove(idx);
        vm.retval = Value::NONE;
        Ok(())
    });
    set_magic(vm, types::TP_LIST, MagicSlot::Add, "list.__add__", |vm, argc, _| {
        check_argc("__add__", argc, 2)?;
        let (Some(mut a), Some(b)) = (sequence_items(vm, vm.arg(0)), sequence_items(vm, vm.arg(1))) else {
            vm.retval = Value::NOT_IMPLEMENTED;
            return Ok(());
        };
        if vm.arg(1).type_of() != types::TP_LIST {
            vm.retval = Value::NOT_IMPLEMENTED;
            return Ok(());
        }
        a.extend(b);
        vm.retval = vm.new_list(a);
        Ok(())
    });
    set_magic(vm, types::TP_LIST, MagicSlot::Mul, "list.__mul__", |vm, argc, _| {
        check_argc("__mul__", argc, 2)?;
        let items = sequence_items(vm, vm.arg(0)).ok_or_else(|| RunError::type_error("expected list"))?;
        match vm.arg(1).as_index() {
            Some(n) => {
                let n = usize::try_from(n.max(0)).expect("non-negative repeat");
                let mut out = Vec::with_capacity(items.len() * n);
                for _ in 0..n {
                    out.extend_from_slice(&items);
                }
                vm.retval = vm.new_list(out);
                Ok(())
            }
            None => {
                vm.retval = Value::NOT_IMPLEMENTED;
                Ok(())
            }
        }
    });
    set_magic(vm, types::TP_LIST, MagicSlot::Eq, "list.__eq__", |vm, argc, _| {
        sequence_eq(vm, argc, types::TP_LIST)
    });
    set_magic(vm, types::TP_LIST, MagicSlot::Iter, "list.__iter__", |vm, argc, _| {
        check_argc("__iter__", argc, 1)?;
        vm.retval = array_iterator_over(vm, vm.arg(0));
        Ok(())
    });
    set_magic(vm, types::TP_LIST, MagicSlot::Contains, "list.__contains__", |vm, argc, _| {
        check_argc("__contains__", argc, 2)?;
        let items = sequence_items(vm, vm.arg(0)).ok_or_else(|| RunError::type_error("expected list"))?;
        let needle = vm.arg(1);
        for item in items {
            if vm.py_eq(item, needle)? {
                vm.retval = Value::new_bool(true);
                return Ok(());
            }
        }
        vm.retval = Value::new_bool(false);
        Ok(())
    });
    set_magic(vm, types::TP_LIST, MagicSlot::Repr, "list.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let items = sequence_items(vm, vm.arg(0)).ok_or_else(|| RunError::type_error("expected list"))?;
        vm.retval = sequence_repr(vm, &items, '[', ']', false)?;
        Ok(())
    });

    set_method(vm, types::TP_LIST, "append", |vm, argc, _| {
        check_argc("append", argc, 2)?;
        let target = vm.arg(0);
        let value = vm.arg(1);
        list_items_mut(vm, target)?.push(value);
        vm.retval = Value::NONE;
        Ok(())
    });
    set_method(vm, types::TP_LIST, "extend", |vm, argc, _| {
        check_argc("extend", argc, 2)?;
        let target = vm.arg(0);
        let src = vm.arg(1);
        let extra = vm.iter_to_vec(src)?;
        list_items_mut(vm, target)?.extend(extra);
        vm.retval = Value::NONE;
        Ok(())
    });
    set_method(vm, types::TP_LIST, "pop", |vm, argc, _| {
        let target = vm.arg(0);
        let index_arg = match argc {
            1 => None,
            2 => Some(
                vm.arg(1)
                    .as_index()
                    .ok_or_else(|| RunError::type_error("list indices must be integers"))?,
            ),
            _ => return Err(RunError::type_error("pop() takes at most 2 arguments")),
        };
        let items = list_items_mut(vm, target)?;
        let popped = match index_arg {
            None => items.pop().ok_or_else(|| RunError::index_error("pop from empty list"))?,
            Some(i) => {
                let idx = normalize_index(i, items.len()).map_err(|_| RunError::index_error("pop index out of range"))?;
                items.remove(idx)
            }
        };
        vm.retval = popped;
        Ok(())
    });
    set_method(vm, types::TP_LIST, "insert", |vm, argc, _| {
        check_argc("insert", argc, 3)?;
        let target = vm.arg(0);
        let i = vm
            .arg(1)
            .as_index()
            .ok_or_else(|| RunError::type_error("list indices must be integers"))?;
        let value = vm.arg(2);
        let items = list_items_mut(vm, target)?;
        let len = i64::try_from(items.len()).expect("length fits i64");
        let idx = if i < 0 { (i + len).max(0) } else { i.min(len) };
        items.insert(usize::try_from(idx).expect("clamped index"), value);
        vm.retval = Value::NONE;
        Ok(())
    });
    set_method(vm, types::TP_LIST, "clear", |vm, argc, _| {
        check_argc("clear", argc, 1)?;
        let target = vm.arg(0);
        list_items_mut(vm, target)?.clear();
        vm.retval = Value::NONE;
        Ok(())
    });
}

fn register_tuple(vm: &mut Vm) {
    set_magic(vm, types::TP_TUPLE, MagicSlot::Len, "tuple.__len__", |vm, argc, _| {
        check_argc("__len__", argc, 1)?;
        let items = sequence_items(vm, vm.arg(0)).ok_or_else(|| RunError::type_error("expected tuple"))?;
        vm.retval = Value::new_int(i64::try_from(items.len()).expect("length fits i64"));
        Ok(())
    });
    set_magic(vm, types::TP_TUPLE, MagicSlot::GetItem, "tuple.__getitem__", |vm, argc, _| {
        check_argc("__getitem__", argc, 2)?;
        let items = sequence_items(vm, vm.arg(0)).ok_or_else(|| RunError::type_error("expected tuple"))?;
        let key = vm.arg(1);
        if let Some(i) = key.as_index() {
            let idx = normalize_index(i, items.len()).map_err(|_| RunError::index_error("tuple index out of range"))?;
            vm.retval = items[idx];
            return Ok(());
        }
        if key.type_of() == types::TP_SLICE {
            let (start, stop, step) = parse_slice(vm, key, items.len())?;
            let picked: Vec<Value> = iter_slice_indices(start, stop, step).into_iter().map(|i| items[i]).collect();
            vm.retval = vm.new_tuple(picked);
            return Ok(());
        }
        Err(RunError::type_error("tuple indices must be integers or slices"))
    });
    set_magic(vm, types::TP_TUPLE, MagicSlot::Eq, "tuple.__eq__", |vm, argc, _| {
        sequence_eq(vm, argc, types::TP_TUPLE)
    });
    set_magic(vm, types::TP_TUPLE, MagicSlot::Iter, "tuple.__iter__", |vm, argc, _| {
        check_argc("__iter__", argc, 1)?;
        vm.retval = array_iterator_over(vm, vm.arg(0));
        Ok(())
    });
    set_magic(vm, types::TP_TUPLE, MagicSlot::Contains, "tuple.__contains__", |vm, argc, _| {
        check_argc("__contains__", argc, 2)?;
        let items = sequence_items(vm, vm.arg(0)).ok_or_else(|| RunError::type_error("expected tuple"))?;
        let needle = vm.arg(1);
        for item in items {
            if vm.py_eq(item, needle)? {
                vm.retval = Value::new_bool(true);
                return Ok(());
            }
        }
        vm.retval = Value::new_bool(false);
        Ok(())
    });
    set_magic(vm, types::TP_TUPLE, MagicSlot::Repr, "tuple.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let items = sequence_items(vm, vm.arg(0)).ok_or_else(|| RunError::type_error("expected tuple"))?;
        vm.retval = sequence_repr(vm, &items, '(', ')', true)?;
        Ok(())
    });
}

// ----------------------------------------------------------------------
// dict
// ----------------------------------------------------------------------

fn dict_pairs(vm: &Vm, v: Value) -> RunResult<Vec<(Value, Value)>> {
    match v.as_obj().map(|id| vm.heap.payload(id)) {
        Some(ObjPayload::Dict(d)) => Ok(d.iter().collect()),
        _ => Err(RunError::type_error("expected dict")),
    }
}

fn register_dict(vm: &mut Vm) {
    set_magic(vm, types::TP_DICT, MagicSlot::New, "dict", |vm, argc, kwargc| {
        no_kwargs("dict", kwargc)?;
        check_argc("dict", argc, 1)?;
        vm.retval = vm.new_dict();
        Ok(())
    });
    set_magic(vm, types::TP_DICT, MagicSlot::Len, "dict.__len__", |vm, argc, _| {
        check_argc("__len__", argc, 1)?;
        let pairs = dict_pairs(vm, vm.arg(0))?;
        vm.retval = Value::new_int(i64::try_from(pairs.len()).expect("length fits i64"));
        Ok(())
    });
    set_magic(vm, types::TP_DICT, MagicSlot::GetItem, "dict.__getitem__", |vm, argc, _| {
        check_argc("__getitem__", argc, 2)?;
        let dict = vm.arg(0);
        let key = vm.arg(1);
        match vm.dict_get(dict, key)? {
            Some(v) => {
                vm.retval = v;
                Ok(())
            }
            None => {
                let repr = vm.py_repr(key)?;
                Err(RunError::key_error(repr))
            }
        }
    });
    set_magic(vm, types::TP_DICT, MagicSlot::SetItem, "dict.__setitem__", |vm, argc, _| {
        check_argc("__setitem__", argc, 3)?;
        let dict = vm.arg(0);
        let key = vm.arg(1);
        let value = vm.arg(2);
        vm.dict_set(dict, key, value)?;
        vm.retval = Value::NONE;
        Ok(())
    });
    set_magic(vm, types::TP_DICT, MagicSlot::DelItem, "dict.__delitem__", |vm, argc, _| {
        check_argc("__delitem__", argc, 2)?;
        let dict = vm.arg(0);
        let key = vm.arg(1);
        if !vm.dict_delete(dict, key)? {
            let repr = vm.py_repr(key)?;
            return Err(RunError::key_error(repr));
        }
        vm.retval = Value::NONE;
        Ok(())
    });
    set_magic(vm, types::TP_DICT, MagicSlot::Contains, "dict.__contains__", |vm, argc, _| {
        check_argc("__contains__", argc, 2)?;
        let dict = vm.arg(0);
        let key = vm.arg(1);
        let found = vm.dict_contains(dict, key)?;
        vm.retval = Value::new_bool(found);
        Ok(())
    });
    set_magic(vm, types::TP_DICT, MagicSlot::Iter, "dict.__iter__", |vm, argc, _| {
        check_argc("__iter__", argc, 1)?;
        let keys: Vec<Value> = dict_pairs(vm, vm.arg(0))?.into_iter().map(|(k, _)| k).collect();
        let snapshot = vm.new_list(keys);
        vm.retval = array_iterator_over(vm, snapshot);
        Ok(())
    });
    set_magic(vm, types::TP_DICT, MagicSlot::Eq, "dict.__eq__", |vm, argc, _| {
        check_argc("__eq__", argc, 2)?;
        let lhs = vm.arg(0);
        let rhs = vm.arg(1);
        if rhs.type_of() != types::TP_DICT {
            vm.retval = Value::NOT_IMPLEMENTED;
            return Ok(());
        }
        let a = dict_pairs(vm, lhs)?;
        let b = dict_pairs(vm, rhs)?;
        if a.len() != b.len() {
            vm.retval = Value::new_bool(false);
            return Ok(());
        }
        for (k, v) in a {
            match vm.dict_get(rhs, k)? {
                Some(other) if vm.py_eq(v, other)? => {}
                _ => {
                    vm.retval = Value::new_bool(false);
                    return Ok(());
                }
            }
        }
        vm.retval = Value::new_bool(true);
        Ok(())
    });
    set_magic(vm, types::TP_DICT, MagicSlot::Repr, "dict.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let pairs = dict_pairs(vm, vm.arg(0))?;
        let mut out = String::from("{");
        for (i, (k, v)) in pairs.into_iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&vm.py_repr(k)?);
            out.push_str(": ");
            out.push_str(&vm.py_repr(v)?);
        }
        out.push('}');
        vm.retval = vm.new_str(&out);
        Ok(())
    });

    set_method(vm, types::TP_DICT, "get", |vm, argc, _| {
        if argc != 2 && argc != 3 {
            return Err(RunError::type_error("get() takes 1 or 2 arguments"));
        }
        let dict = vm.arg(0);
        let key = vm.arg(1);
        let default = if argc == 3 { vm.arg(2) } else { Value::NONE };
        vm.retval = vm.dict_get(dict, key)?.unwrap_or(default);
        Ok(())
    });
    set_method(vm, types::TP_DICT, "keys", |vm, argc, _| {
        check_argc("keys", argc, 1)?;
        let keys: Vec<Value> = dict_pairs(vm, vm.arg(0))?.into_iter().map(|(k, _)| k).collect();
        vm.retval = vm.new_list(keys);
        Ok(())
    });
    set_method(vm, types::TP_DICT, "values", |vm, argc, _| {
        check_argc("values", argc, 1)?;
        let values: Vec<Value> = dict_pairs(vm, vm.arg(0))?.into_iter().map(|(_, v)| v).collect();
        vm.retval = vm.new_list(values);
        Ok(())
    });
    set_method(vm, types::TP_DICT, "items", |vm, argc, _| {
        check_argc("items", argc, 1)?;
        let pairs = dict_pairs(vm, vm.arg(0))?;
        let mut out = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            out.push(vm.new_tuple(vec![k, v]));
        }
        vm.retval = vm.new_list(out);
        Ok(())
    });
}

// ----------------------------------------------------------------------
// slice / range
// ----------------------------------------------------------------------

fn register_slice(vm: &mut Vm) {
    set_magic(vm, types::TP_SLICE, MagicSlot::Repr, "slice.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let Some(id) = vm.arg(0).as_obj() else {
            return Err(RunError::type_error("expected slice"));
        };
        let ObjPayload::Slice { start, stop, step } = vm.heap.payload(id) else {
            return Err(RunError::type_error("expected slice"));
        };
        let (start, stop, step) = (*start, *stop, *step);
        let s = vm.py_repr(start)?;
        let e = vm.py_repr(stop)?;
        let st = vm.py_repr(step)?;
        let text = format!("slice({s}, {e}, {st})");
        vm.retval = vm.new_str(&text);
        Ok(())
    });
    set_property(vm, types::TP_SLICE, "start", "slice.start", |vm, argc, _| {
        check_argc("start", argc, 1)?;
        let Some(id) = vm.arg(0).as_obj() else {
            return Err(RunError::type_error("expected slice"));
        };
        let ObjPayload::Slice { start, .. } = vm.heap.payload(id) else {
            return Err(RunError::type_error("expected slice"));
        };
        vm.retval = *start;
        Ok(())
    });
    set_property(vm, types::TP_SLICE, "stop", "slice.stop", |vm, argc, _| {
        check_argc("stop", argc, 1)?;
        let Some(id) = vm.arg(0).as_obj() else {
            return Err(RunError::type_error("expected slice"));
        };
        let ObjPayload::Slice { stop, .. } = vm.heap.payload(id) else {
            return Err(RunError::type_error("expected slice"));
        };
        vm.retval = *stop;
        Ok(())
    });
    set_property(vm, types::TP_SLICE, "step", "slice.step", |vm, argc, _| {
        check_argc("step", argc, 1)?;
        let Some(id) = vm.arg(0).as_obj() else {
            return Err(RunError::type_error("expected slice"));
        };
        let ObjPayload::Slice { step, .. } = vm.heap.payload(id) else {
            return Err(RunError::type_error("expected slice"));
        };
        vm.retval = *step;
        Ok(())
    });
}

fn range_fields(vm: &Vm, v: Value) -> RunResult<(i64, i64, i64)> {
    let Some(id) = v.as_obj() else {
        return Err(RunError::type_error("expected range"));
    };
    match vm.heap.payload(id) {
        ObjPayload::Range { start, stop, step } => Ok((*start, *stop, *step)),
        _ => Err(RunError::type_error("expected range")),
    }
}

fn register_range(vm: &mut Vm) {
    set_magic(vm, types::TP_RANGE, MagicSlot::New, "range", |vm, argc, kwargc| {
        no_kwargs("range", kwargc)?;
        fn to_int(v: Value) -> RunResult<i64> {
            v.as_index()
                .ok_or_else(|| RunError::type_error("range() arguments must be integers"))
        }
        let (start, stop, step) = match argc {
            2 => (0, to_int(vm.arg(1))?, 1),
            3 => (to_int(vm.arg(1))?, to_int(vm.arg(2))?, 1),
            4 => (to_int(vm.arg(1))?, to_int(vm.arg(2))?, to_int(vm.arg(3))?),
            _ => return Err(RunError::type_error("range() takes 1 to 3 arguments")),
        };
        if step == 0 {
            return Err(RunError::value_error("range() arg 3 must not be zero"));
        }
        vm.retval = vm.new_range(start, stop, step);
        Ok(())
    });
    set_magic(vm, types::TP_RANGE, MagicSlot::Iter, "range.__iter__", |vm, argc, _| {
        check_argc("__iter__", argc, 1)?;
        let (start, stop, step) = range_fields(vm, vm.arg(0))?;
        let id = vm.heap.alloc(
            types::TP_RANGE_ITERATOR,
            ObjPayload::RangeIterator {
                current: start,
                stop,
                step,
            },
        );
        vm.retval = Value::Boxed(types::TP_RANGE_ITERATOR, id);
        Ok(())
    });
    set_magic(vm, types::TP_RANGE, MagicSlot::Len, "range.__len__", |vm, argc, _| {
        check_argc("__len__", argc, 1)?;
        let (start, stop, step) = range_fields(vm, vm.arg(0))?;
        let len = if step > 0 {
            let diff = (stop - start).max(0);
            (diff + step - 1) / step
        } else {
            let diff = (start - stop).max(0);
            let step = -step;
            (diff + step - 1) / step
        };
        vm.retval = Value::new_int(len);
        Ok(())
    });
    set_magic(vm, types::TP_RANGE, MagicSlot::Repr, "range.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let (start, stop, step) = range_fields(vm, vm.arg(0))?;
        let text = if step == 1 {
            format!("range({start}, {stop})")
        } else {
            format!("range({start}, {stop}, {step})")
        };
        vm.retval = vm.new_str(&text);
        Ok(())
    });
}

// ----------------------------------------------------------------------
// Iterators
// ----------------------------------------------------------------------

fn self_iter(vm: &mut Vm, argc: usize, _kwargc: usize) -> RunResult<()> {
    check_argc("__iter__", argc, 1)?;
    vm.retval = vm.arg(0);
    Ok(())
}

fn register_iterators(vm: &mut Vm) {
    set_magic(vm, types::TP_RANGE_ITERATOR, MagicSlot::Iter, "range_iterator.__iter__", self_iter);
    set_magic(vm, types::TP_RANGE_ITERATOR, MagicSlot::Next, "range_iterator.__next__", |vm, argc, _| {
        check_argc("__next__", argc, 1)?;
        let Some(id) = vm.arg(0).as_obj() else {
            return Err(RunError::type_error("expected range_iterator"));
        };
        let ObjPayload::RangeIterator { current, stop, step } = vm.heap.payload_mut(id) else {
            return Err(RunError::type_error("expected range_iterator"));
        };
        let exhausted = if *step > 0 { *current >= *stop } else { *current <= *stop };
        if exhausted {
            return Err(RunError::stop_iteration());
        }
        let v = *current;
        *current += *step;
        vm.retval = Value::new_int(v);
        Ok(())
    });

    set_magic(vm, types::TP_ARRAY_ITERATOR, MagicSlot::Iter, "array_iterator.__iter__", self_iter);
    set_magic(vm, types::TP_ARRAY_ITERATOR, MagicSlot::Next, "array_iterator.__next__", |vm, argc, _| {
        check_argc("__next__", argc, 1)?;
        let Some(id) = vm.arg(0).as_obj() else {
            return Err(RunError::type_error("expected array_iterator"));
        };
        let ObjPayload::ArrayIterator { seq, index } = vm.heap.payload(id) else {
            return Err(RunError::type_error("expected array_iterator"));
        };
        let (seq, i) = (*seq, *index);
        let items = sequence_items(vm, seq).ok_or_else(|| RunError::type_error("iterator over non-sequence"))?;
        if i >= items.len() {
            return Err(RunError::stop_iteration());
        }
        if let ObjPayload::ArrayIterator { index, .. } = vm.heap.payload_mut(id) {
            *index = i + 1;
        }
        vm.retval = items[i];
        Ok(())
    });

    set_magic(vm, types::TP_STR_ITERATOR, MagicSlot::Iter, "str_iterator.__iter__", self_iter);
    set_magic(vm, types::TP_STR_ITERATOR, MagicSlot::Next, "str_iterator.__next__", |vm, argc, _| {
        check_argc("__next__", argc, 1)?;
        let Some(id) = vm.arg(0).as_obj() else {
            return Err(RunError::type_error("expected str_iterator"));
        };
        let ObjPayload::StrIterator { s, index } = vm.heap.payload(id) else {
            return Err(RunError::type_error("expected str_iterator"));
        };
        let (s, i) = (*s, *index);
        let text = vm.str_of(s).ok_or_else(|| RunError::type_error("iterator over non-string"))?;
        match text.chars().nth(i) {
            Some(c) => {
                if let ObjPayload::StrIterator { index, .. } = vm.heap.payload_mut(id) {
                    *index = i + 1;
                }
                let out = c.to_string();
                vm.retval = vm.new_str(&out);
                Ok(())
            }
            None => Err(RunError::stop_iteration()),
        }
    });
}

// ----------------------------------------------------------------------
// Callables and descriptors
// ----------------------------------------------------------------------

fn register_callables(vm: &mut Vm) {
    set_magic(vm, types::TP_FUNCTION, MagicSlot::Repr, "function.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let Some(id) = vm.arg(0).as_obj() else {
            return Err(RunError::type_error("expected function"));
        };
        let ObjPayload::Function(f) = vm.heap.payload(id) else {
            return Err(RunError::type_error("expected function"));
        };
        let text = format!("<function {}>", f.decl.name);
        vm.retval = vm.new_str(&text);
        Ok(())
    });
    set_magic(vm, types::TP_NATIVEFUNC, MagicSlot::Repr, "nativefunc.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let Some(id) = vm.arg(0).as_obj() else {
            return Err(RunError::type_error("expected nativefunc"));
        };
        let ObjPayload::NativeFunc(f) = vm.heap.payload(id) else {
            return Err(RunError::type_error("expected nativefunc"));
        };
        let text = format!("<nativefunc {}>", f.name);
        vm.retval = vm.new_str(&text);
        Ok(())
    });
    set_magic(vm, types::TP_BOUNDMETHOD, MagicSlot::Repr, "boundmethod.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        vm.retval = vm.new_str("<bound method>");
        Ok(())
    });
}

fn register_descriptors(vm: &mut Vm) {
    set_magic(vm, types::TP_STATICMETHOD, MagicSlot::New, "staticmethod", |vm, argc, kwargc| {
        no_kwargs("staticmethod", kwargc)?;
        check_argc("staticmethod", argc, 2)?;
        let inner = vm.arg(1);
        let id = vm.heap.alloc(types::TP_STATICMETHOD, ObjPayload::StaticMethod(inner));
        vm.retval = Value::Boxed(types::TP_STATICMETHOD, id);
        Ok(())
    });
    set_magic(vm, types::TP_CLASSMETHOD, MagicSlot::New, "classmethod", |vm, argc, kwargc| {
        no_kwargs("classmethod", kwargc)?;
        check_argc("classmethod", argc, 2)?;
        let inner = vm.arg(1);
        let id = vm.heap.alloc(types::TP_CLASSMETHOD, ObjPayload::ClassMethod(inner));
        vm.retval = Value::Boxed(types::TP_CLASSMETHOD, id);
        Ok(())
    });
    set_magic(vm, types::TP_PROPERTY, MagicSlot::New, "property", |vm, argc, kwargc| {
        no_kwargs("property", kwargc)?;
        if argc != 2 && argc != 3 {
            return Err(RunError::type_error("property() takes 1 or 2 arguments"));
        }
        let getter = vm.arg(1);
        let setter = if argc == 3 { vm.arg(2) } else { Value::NIL };
        let id = vm.heap.alloc(types::TP_PROPERTY, ObjPayload::Property { getter, setter });
        vm.retval = Value::Boxed(types::TP_PROPERTY, id);
        Ok(())
    });
}

fn register_super(vm: &mut Vm) {
    set_magic(vm, types::TP_SUPER, MagicSlot::New, "super", |vm, argc, kwargc| {
        no_kwargs("super", kwargc)?;
        // only the two-argument form; the zero-argument form needs
        // compiler-provided class cells
        check_argc("super", argc, 3)?;
        let cls = vm.arg(1);
        let receiver = vm.arg(2);
        let tid = vm
            .as_type_id(cls)
            .ok_or_else(|| RunError::type_error("super() argument 1 must be a type"))?;
        if !vm.types.issubclass(receiver.type_of(), tid) {
            return Err(RunError::type_error("super() argument 2 must be an instance of argument 1"));
        }
        let start = vm.types.get(tid).base;
        if start == types::TP_NIL {
            return Err(RunError::type_error("super(): no base class"));
        }
        let id = vm.heap.alloc(types::TP_SUPER, ObjPayload::Super { start, receiver });
        vm.retval = Value::Boxed(types::TP_SUPER, id);
        Ok(())
    });
}

fn register_module_type(vm: &mut Vm) {
    set_magic(vm, types::TP_MODULE, MagicSlot::Repr, "module.__repr__", |vm, argc, _| {
        check_argc("__repr__", argc, 1)?;
        let Some(id) = vm.arg(0).as_obj() else {
            return Err(RunError::type_error("expected module"));
        };
        let ObjPayload::Module(info) = vm.heap.payload(id) else {
            return Err(RunError::type_error("expected module"));
        };
        let text = format!("<module '{}'>", info.path);
        vm.retval = vm.new_str(&text);
        Ok(())
    });
}

fn register_generator(vm: &mut Vm) {
    set_magic(vm, types::TP_GENERATOR, MagicSlot::Iter, "generator.__iter__", self_iter);
    set_magic(vm, types::TP_GENERATOR, MagicSlot::Next, "generator.__next__", |vm, argc, _| {
        check_argc("__next__", argc, 1)?;
        let Some(gid) = vm.arg(0).as_obj() else {
            return Err(RunError::type_error("expected generator"));
        };
        match vm.resume_generator(gid)? {
            Some(v) => {
                vm.retval = v;
                Ok(())
            }
            None => Err(RunError::stop_iteration()),
        }
    });
}

// ----------------------------------------------------------------------
// Exceptions
// ----------------------------------------------------------------------

fn register_exceptions(vm: &mut Vm) {
    for kind in ExcKind::iter() {
        let base_tid = match kind.base() {
            Some(base) => vm.types.exc_type(base),
            None => types::TP_OBJECT,
        };
        let name = vm.interns.intern(kind.into());
        let tid = vm
            .types
            .new_type(name, base_tid, vm.builtins, None, false, false)
            .expect("exception registration cannot fail");
        let obj_id = vm.heap.alloc_with_attrs(types::TP_TYPE, ObjPayload::TypeRef(tid));
        let type_value = Value::Boxed(types::TP_TYPE, obj_id);
        vm.types.get_mut(tid).self_value = type_value;
        vm.types.set_exc_type(kind, tid);
        let builtins = vm.builtins;
        vm.set_module_attr(builtins, name, type_value);

        if kind == ExcKind::BaseException {
            set_magic(vm, tid, MagicSlot::New, "BaseException", exc_new);
            set_magic(vm, tid, MagicSlot::Repr, "BaseException.__repr__", exc_repr);
            set_magic(vm, tid, MagicSlot::Str, "BaseException.__str__", exc_str);
        }
    }
}

fn exc_new(vm: &mut Vm, argc: usize, kwargc: usize) -> RunResult<()> {
    no_kwargs("BaseException", kwargc)?;
    if argc > 2 {
        return Err(RunError::type_error("exceptions take at most 1 argument"));
    }
    let tid = vm
        .as_type_id(vm.arg(0))
        .ok_or_else(|| RunError::type_error("exception constructor expects a class"))?;
    let (msg, arg) = if argc == 2 {
        let v = vm.arg(1);
        (Some(vm.py_str(v)?), v)
    } else {
        (None, Value::NIL)
    };
    let id = vm.heap.alloc(
        tid,
        ObjPayload::Exception(ExcPayload {
            msg: msg.map(String::into_boxed_str),
            arg,
            traceback: Vec::new(),
        }),
    );
    vm.retval = Value::Boxed(tid, id);
    Ok(())
}

fn exc_repr(vm: &mut Vm, argc: usize, _kwargc: usize) -> RunResult<()> {
    check_argc("__repr__", argc, 1)?;
    let v = vm.arg(0);
    let type_name = vm.type_name(v.type_of()).to_owned();
    let msg = vm.exception_message(v);
    let text = if msg.is_empty() {
        format!("{type_name}()")
    } else {
        format!("{type_name}({})", quote_str(&msg))
    };
    vm.retval = vm.new_str(&text);
    Ok(())
}

fn exc_str(vm: &mut Vm, argc: usize, _kwargc: usize) -> RunResult<()> {
    check_argc("__str__", argc, 1)?;
    let v = vm.arg(0);
    let msg = vm.exception_message(v);
    vm.retval = vm.new_str(&msg);
    Ok(())
}

// ----------------------------------------------------------------------
// Builtin functions
// ----------------------------------------------------------------------

fn register_builtin_functions(vm: &mut Vm) {
    set_builtin(vm, "print", |vm, argc, kwargc| {
        let mut sep = " ".to_owned();
        let mut end = "\n".to_owned();
        let mut flush = false;
        for i in 0..kwargc {
            let (k, v) = vm.kwarg(argc, i);
            let Some(key) = vm.str_of(k).map(str::to_owned) else {
                return Err(RunError::type_error("keywords must be strings"));
            };
            match key.as_str() {
                "sep" => sep = vm.py_str(v)?,
                "end" => end = vm.py_str(v)?,
                "flush" => flush = vm.py_bool(v)?,
                other => {
                    return Err(RunError::type_error(format!(
                        "print() got an unexpected keyword argument '{other}'"
                    )));
                }
            }
        }
        let mut pieces = Vec::with_capacity(argc);
        for i in 0..argc {
            let v = vm.arg(i);
            pieces.push(vm.py_str(v)?);
        }
        let text = format!("{}{}", pieces.join(&sep), end);
        (vm.hooks.print)(&text);
        if flush {
            (vm.hooks.flush)();
        }
        vm.retval = Value::NONE;
        Ok(())
    });

    set_builtin(vm, "len", |vm, argc, kwargc| {
        no_kwargs("len", kwargc)?;
        check_argc("len", argc, 1)?;
        let v = vm.arg(0);
        let n = vm.py_len(v)?;
        vm.retval = Value::new_int(n);
        Ok(())
    });

    set_builtin(vm, "repr", |vm, argc, kwargc| {
        no_kwargs("repr", kwargc)?;
        check_argc("repr", argc, 1)?;
        let v = vm.arg(0);
        let text = vm.py_repr(v)?;
        vm.retval = vm.new_str(&text);
        Ok(())
    });

    set_builtin(vm, "hash", |vm, argc, kwargc| {
        no_kwargs("hash", kwargc)?;
        check_argc("hash", argc, 1)?;
        let v = vm.arg(0);
        let h = vm.py_hash(v)?;
        vm.retval = Value::new_int(h);
        Ok(())
    });

    set_builtin(vm, "iter", |vm, argc, kwargc| {
        no_kwargs("iter", kwargc)?;
        check_argc("iter", argc, 1)?;
        let v = vm.arg(0);
        vm.retval = vm.py_iter(v)?;
        Ok(())
    });

    set_builtin(vm, "next", |vm, argc, kwargc| {
        no_kwargs("next", kwargc)?;
        if argc != 1 && argc != 2 {
            return Err(RunError::type_error("next() takes 1 or 2 arguments"));
        }
        let it = vm.arg(0);
        match vm.py_next(it)? {
            Some(v) => {
                vm.retval = v;
                Ok(())
            }
            None if argc == 2 => {
                vm.retval = vm.arg(1);
                Ok(())
            }
            None => Err(RunError::stop_iteration()),
        }
    });

    set_builtin(vm, "abs", |vm, argc, kwargc| {
        no_kwargs("abs", kwargc)?;
        check_argc("abs", argc, 1)?;
        let v = vm.arg(0);
        vm.retval = vm.call_magic_required(MagicSlot::Abs, &[v])?;
        Ok(())
    });

    set_builtin(vm, "chr", |vm, argc, kwargc| {
        no_kwargs("chr", kwargc)?;
        check_argc("chr", argc, 1)?;
        let n = vm
            .arg(0)
            .as_index()
            .ok_or_else(|| RunError::type_error("chr() requires an integer"))?;
        if !(0..=0x10FFFF).contains(&n) {
            return Err(RunError::value_error("chr() arg not in range(0x110000)"));
        }
        let c = char::from_u32(u32::try_from(n).expect("range-checked"))
            .ok_or_else(|| RunError::value_error("chr() arg is a surrogate"))?;
        let text = c.to_string();
        vm.retval = vm.new_str(&text);
        Ok(())
    });

    set_builtin(vm, "ord", |vm, argc, kwargc| {
        no_kwargs("ord", kwargc)?;
        check_argc("ord", argc, 1)?;
        let s = arg_str(vm, 0)?;
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => {
                vm.retval = Value::new_int(i64::from(u32::from(c)));
                Ok(())
            }
            _ => Err(RunError::type_error("ord() expected a character")),
        }
    });

    set_builtin(vm, "isinstance", |vm, argc, kwargc| {
        no_kwargs("isinstance", kwargc)?;
        check_argc("isinstance", argc, 2)?;
        let v = vm.arg(0);
        let cls = vm.arg(1);
        let b = vm.py_isinstance(v, cls)?;
        vm.retval = Value::new_bool(b);
        Ok(())
    });

    set_builtin(vm, "issubclass", |vm, argc, kwargc| {
        no_kwargs("issubclass", kwargc)?;
        check_argc("issubclass", argc, 2)?;
        let a = vm.arg(0);
        let cls = vm.arg(1);
        let b = vm.py_issubclass(a, cls)?;
        vm.retval = Value::new_bool(b);
        Ok(())
    });

    set_builtin(vm, "input", |vm, argc, kwargc| {
        no_kwargs("input", kwargc)?;
        if argc > 1 {
            return Err(RunError::type_error("input() takes at most 1 argument"));
        }
        if argc == 1 {
            let prompt = vm.py_str(vm.arg(0))?;
            (vm.hooks.print)(&prompt);
        }
        let mut line = String::new();
        loop {
            let c = (vm.hooks.getchr)();
            if c < 0 || c == i32::from(b'\n') || c == i32::from(b'\r') {
                break;
            }
            line.push(char::from(u8::try_from(c & 0xFF).expect("masked to a byte")));
        }
        vm.retval = vm.new_str(&line);
        Ok(())
    });

    set_builtin(vm, "exit", |vm, argc, kwargc| {
        no_kwargs("exit", kwargc)?;
        let code = match argc {
            0 => 0,
            1 => vm
                .arg(0)
                .as_index()
                .ok_or_else(|| RunError::type_error("exit() argument must be an integer"))?,
            _ => return Err(RunError::type_error("exit() takes at most 1 argument")),
        };
        Err(RunError::Raise(ExcKind::SystemExit, Some(code.to_string())))
    });

    set_builtin(vm, "id", |vm, argc, kwargc| {
        no_kwargs("id", kwargc)?;
        check_argc("id", argc, 1)?;
        vm.retval = Value::new_int(vm.py_id(vm.arg(0)));
        Ok(())
    });

    set_builtin(vm, "sum", |vm, argc, kwargc| {
        no_kwargs("sum", kwargc)?;
        if argc != 1 && argc != 2 {
            return Err(RunError::type_error("sum() takes 1 or 2 arguments"));
        }
        let mut acc = if argc == 2 { vm.arg(1) } else { Value::new_int(0) };
        let src = vm.arg(0);
        let it = vm.py_iter(src)?;
        while let Some(item) = vm.py_next(it)? {
            acc = match (acc.as_int(), item.as_int()) {
                (Some(a), Some(b)) => Value::new_int(
                    a.checked_add(b).ok_or_else(|| RunError::overflow("integer addition overflow"))?,
                ),
                _ => match (acc.as_number(), item.as_number()) {
                    (Some(a), Some(b)) => Value::new_float(a + b),
                    _ => return Err(RunError::type_error("unsupported operand type(s) for +")),
                },
            };
        }
        vm.retval = acc;
        Ok(())
    });
}

fn register_gc_module(vm: &mut Vm) {
    let gc_module = vm.new_module("gc");
    let collect = new_native(vm, "collect", |vm, argc, kwargc| {
        no_kwargs("collect", kwargc)?;
        check_argc("collect", argc, 0)?;
        let freed = vm.collect_garbage();
        vm.retval = Value::new_int(i64::try_from(freed).expect("freed count fits i64"));
        Ok(())
    });
    let n = vm.interns.intern("collect");
    vm.set_module_attr(gc_module, n, collect);
}

/// Exposes the type objects under their Python names.
fn expose_types(vm: &mut Vm) {
    let pairs: &[(&str, TypeId)] = &[
        ("object", types::TP_OBJECT),
        ("type", types::TP_TYPE),
        ("int", types::TP_INT),
        ("float", types::TP_FLOAT),
        ("bool", types::TP_BOOL),
        ("str", types::TP_STR),
        ("list", types::TP_LIST),
        ("tuple", types::TP_TUPLE),
        ("dict", types::TP_DICT),
        ("slice", types::TP_SLICE),
        ("range", types::TP_RANGE),
        ("super", types::TP_SUPER),
        ("property", types::TP_PROPERTY),
        ("staticmethod", types::TP_STATICMETHOD),
        ("classmethod", types::TP_CLASSMETHOD),
        ("vec2", types::TP_VEC2),
        ("vec2i", types::TP_VEC2I),
    ];
    for &(name, tid) in pairs {
        let n = vm.interns.intern(name);
        let type_value = vm.types.get(tid).self_value;
        let builtins = vm.builtins;
        vm.set_module_attr(builtins, n, type_value);
    }
}
