//! Binary-operator dispatch and the equality/hash protocols.
//!
//! `binary_op` implements the reflected-operand protocol: the left type's
//! slot runs first; `NotImplemented` defers to the right type's reflected
//! slot; if both decline the operation is a `TypeError`. Comparisons go
//! through the same machinery except `==`/`!=`, which fall back to
//! identity when `__eq__` is absent or declines.

use std::hash::{BuildHasher, Hasher};

use crate::{
    error::{RunError, RunResult},
    object::ObjPayload,
    types::{self, MagicSlot},
    value::Value,
    vm::Vm,
};

impl Vm {
    /// Pops two operands and dispatches `lhs.op(rhs)`, then
    /// `rhs.rop(lhs)`, then raises `TypeError`.
    pub(crate) fn binary_op(&mut self, op: MagicSlot, rop: Option<MagicSlot>, symbol: &str) -> RunResult<Value> {
        let rhs = self.pop();
        let lhs = self.pop();
        self.binary_op_values(lhs, rhs, op, rop, symbol)
    }

    pub(crate) fn binary_op_values(
        &mut self,
        lhs: Value,
        rhs: Value,
        op: MagicSlot,
        rop: Option<MagicSlot>,
        symbol: &str,
    ) -> RunResult<Value> {
        if let Some(f) = self.magic_of(lhs.type_of(), op) {
            let r = self.call_value(f, &[lhs, rhs])?;
            if !r.is_not_implemented() {
                return Ok(r);
            }
        }
        if let Some(rop) = rop
            && let Some(f) = self.magic_of(rhs.type_of(), rop)
        {
            let r = self.call_value(f, &[rhs, lhs])?;
            if !r.is_not_implemented() {
                return Ok(r);
            }
        }
        Err(RunError::type_error(format!(
            "unsupported operand type(s) for {symbol}: '{}' and '{}'",
            self.type_name(lhs.type_of()),
            self.type_name(rhs.type_of())
        )))
    }

    // ------------------------------------------------------------------
    // Equality
    // ------------------------------------------------------------------

    /// `a == b`. A missing (or declining) `__eq__` compares identity;
    /// `NotImplemented` never escapes this helper.
    pub fn py_eq(&mut self, a: Value, b: Value) -> RunResult<bool> {
        // fast paths for the inline scalar lattice
        if let (Some(x), Some(y)) = (a.as_index(), b.as_index()) {
            return Ok(x == y);
        }
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(x == y);
        }
        if self.is_identical(a, b) {
            return Ok(true);
        }
        if let Some(f) = self.magic_of(a.type_of(), MagicSlot::Eq) {
            let r = self.call_value(f, &[a, b])?;
            if !r.is_not_implemented() {
                return self.py_bool(r);
            }
        }
        if let Some(f) = self.magic_of(b.type_of(), MagicSlot::Eq) {
            let r = self.call_value(f, &[b, a])?;
            if !r.is_not_implemented() {
                return self.py_bool(r);
            }
        }
        Ok(false)
    }

    /// `a != b`: the `__ne__` slot when present, otherwise negated
    /// `__eq__`.
    pub fn py_ne(&mut self, a: Value, b: Value) -> RunResult<bool> {
        if let Some(f) = self.magic_of(a.type_of(), MagicSlot::Ne) {
            let r = self.call_value(f, &[a, b])?;
            if !r.is_not_implemented() {
                return self.py_bool(r);
            }
        }
        Ok(!self.py_eq(a, b)?)
    }

    // ------------------------------------------------------------------
    // Hashing
    // ------------------------------------------------------------------

    /// `hash(v)`. Numeric values hash equal when they compare equal;
    /// instances use `__hash__` or fall back to identity; mutable
    /// containers are unhashable.
    pub fn py_hash(&mut self, v: Value) -> RunResult<i64> {
        match v {
            Value::Inline(t, s) if t == types::TP_INT => Ok(s.as_int()),
            Value::Inline(t, s) if t == types::TP_BOOL => Ok(i64::from(s.as_bool())),
            Value::Inline(t, s) if t == types::TP_FLOAT => {
                let f = s.as_float();
                // integral floats hash like the integer they equal
                if f.fract() == 0.0 && f.abs() < 9.2e18 {
                    Ok(f as i64)
                } else {
                    Ok(s.as_int())
                }
            }
            Value::Inline(t, _) if t == types::TP_NONE => Ok(0x6e6f6e65),
            Value::Inline(_, s) => Ok(s.as_int()),
            Value::Boxed(t, id) if t == types::TP_STR => {
                let ObjPayload::Str(text) = self.heap.payload(id) else {
                    unreachable!("str tag without str payload");
                };
                Ok(self.hash_bytes(text.as_bytes()))
            }
            Value::Boxed(t, id) if t == types::TP_TUPLE => {
                let ObjPayload::Tuple(items) = self.heap.payload(id) else {
                    unreachable!("tuple tag without tuple payload");
                };
                let items = items.to_vec();
                let mut acc: i64 = 0x345678;
                for item in items {
                    let h = self.py_hash(item)?;
                    acc = acc.wrapping_mul(1_000_003).wrapping_add(h);
                }
                Ok(acc)
            }
            Value::Boxed(t, _) if t == types::TP_LIST || t == types::TP_DICT => Err(RunError::type_error(format!(
                "unhashable type: '{}'",
                self.type_name(t)
            ))),
            Value::Boxed(t, id) => {
                if let Some(f) = self.magic_of(t, MagicSlot::Hash) {
                    let r = self.call_value(f, &[v])?;
                    return r.as_index().ok_or_else(|| RunError::type_error("__hash__ should return int"));
                }
                Ok(i64::try_from(id.index()).unwrap_or(i64::MAX))
            }
        }
    }

    /// Hashes raw bytes with the VM's per-slot seed.
    pub(crate) fn hash_bytes(&self, bytes: &[u8]) -> i64 {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(bytes);
        hasher.finish().cast_signed()
    }

    // ------------------------------------------------------------------
    // Dict operations (hash narrows candidates, `py_eq` decides)
    // ------------------------------------------------------------------

    fn dict_find(&mut self, dict: Value, key: Value, hash: u64) -> RunResult<Option<u32>> {
        let Some(id) = dict.as_obj() else {
            return Err(RunError::type_error("expected a dict"));
        };
        let ObjPayload::Dict(d) = self.heap.payload(id) else {
            return Err(RunError::type_error("expected a dict"));
        };
        let candidates = d.candidates(hash);
        for (pos, candidate_key) in candidates {
            if self.py_eq(candidate_key, key)? {
                return Ok(Some(pos));
            }
        }
        Ok(None)
    }

    /// `dict[key] = value`.
    pub fn dict_set(&mut self, dict: Value, key: Value, value: Value) -> RunResult<()> {
        // key equality may run user code; collection is deferred so the
        // in-flight key/value stay alive while unreachable from any root
        self.heap.lock_gc();
        let result = self.dict_set_inner(dict, key, value);
        self.heap.unlock_gc();
        result
    }

    fn dict_set_inner(&mut self, dict: Value, key: Value, value: Value) -> RunResult<()> {
        let hash = self.py_hash(key)?.cast_unsigned();
        let found = self.dict_find(dict, key, hash)?;
        let id = dict.as_obj().expect("checked by dict_find");
        let ObjPayload::Dict(d) = self.heap.payload_mut(id) else {
            unreachable!("checked by dict_find");
        };
        match found {
            Some(pos) => d.set_value_at(pos, value),
            None => d.push(hash, key, value),
        }
        Ok(())
    }

    /// `dict[key]`, or `None` when the key is absent.
    pub fn dict_get(&mut self, dict: Value, key: Value) -> RunResult<Option<Value>> {
        self.heap.lock_gc();
        let result = self.dict_get_inner(dict, key);
        self.heap.unlock_gc();
        result
    }

    fn dict_get_inner(&mut self, dict: Value, key: Value) -> RunResult<Option<Value>> {
        let hash = self.py_hash(key)?.cast_unsigned();
        let found = self.dict_find(dict, key, hash)?;
        Ok(found.map(|pos| {
            let id = dict.as_obj().expect("checked by dict_find");
            let ObjPayload::Dict(d) = self.heap.payload(id) else {
                unreachable!("checked by dict_find");
            };
            d.value_at(pos)
        }))
    }

    /// `del dict[key]`; false when absent.
    pub fn dict_delete(&mut self, dict: Value, key: Value) -> RunResult<bool> {
        self.heap.lock_gc();
        let result = self.dict_delete_inner(dict, key);
        self.heap.unlock_gc();
        result
    }

    fn dict_delete_inner(&mut self, dict: Value, key: Value) -> RunResult<bool> {
        let hash = self.py_hash(key)?.cast_unsigned();
        let found = self.dict_find(dict, key, hash)?;
        match found {
            Some(pos) => {
                let id = dict.as_obj().expect("checked by dict_find");
                let ObjPayload::Dict(d) = self.heap.payload_mut(id) else {
                    unreachable!("checked by dict_find");
                };
                d.remove_at(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// `key in dict`.
    pub fn dict_contains(&mut self, dict: Value, key: Value) -> RunResult<bool> {
        Ok(self.dict_get(dict, key)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_crosses_types() {
        let mut vm = Vm::new();
        assert!(vm.py_eq(Value::new_int(3), Value::new_float(3.0)).unwrap());
        assert!(vm.py_eq(Value::new_bool(true), Value::new_int(1)).unwrap());
        assert!(!vm.py_eq(Value::new_int(3), Value::NONE).unwrap());
    }

    #[test]
    fn test_str_equality_and_hash_consistency() {
        let mut vm = Vm::new();
        let a = vm.new_str("spam");
        let b = vm.new_str("spam");
        assert!(vm.py_eq(a, b).unwrap());
        assert_eq!(vm.py_hash(a).unwrap(), vm.py_hash(b).unwrap());
    }

    #[test]
    fn test_dict_set_get_delete() {
        let mut vm = Vm::new();
        let dict = vm.new_dict();
        let key = vm.new_str("k");
        vm.dict_set(dict, key, Value::new_int(7)).unwrap();

        let same_key = vm.new_str("k");
        assert_eq!(vm.dict_get(dict, same_key).unwrap(), Some(Value::new_int(7)));
        assert!(vm.dict_delete(dict, same_key).unwrap());
        assert_eq!(vm.dict_get(dict, same_key).unwrap(), None);
    }

    #[test]
    fn test_unhashable_list_key() {
        let mut vm = Vm::new();
        let dict = vm.new_dict();
        let key = vm.new_list(vec![]);
        assert!(vm.dict_set(dict, key, Value::NONE).is_err());
    }
}
