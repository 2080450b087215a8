//! The pickle wire format.
//!
//! Values serialise to a [`PickleNode`] tree encoded with postcard. The
//! format is opaque but stable within one build; it is the only way data
//! crosses VM slots. The closed round-trip set is: `None`, `bool`, `int`,
//! `float`, `str`, the 2-vectors, `tuple`, `list`, `dict` with picklable
//! keys, and user types with registered codecs.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::{RunError, RunResult},
    object::ObjPayload,
    types,
    value::Value,
    vm::Vm,
};

/// Recursion bound while building the node tree; cycles are caught by
/// running out of depth.
const MAX_PICKLE_DEPTH: usize = 64;

/// The serialised shape of a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PickleNode {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Vec2(f32, f32),
    Vec2i(i32, i32),
    Tuple(Vec<PickleNode>),
    List(Vec<PickleNode>),
    Dict(Vec<(PickleNode, PickleNode)>),
    /// A user type with a registered codec.
    Custom { type_name: String, data: Box<PickleNode> },
}

/// Encodes one user-typed value into a node.
pub type PickleEncodeFn = fn(&mut Vm, Value) -> RunResult<PickleNode>;
/// Decodes one user-typed value from a node.
pub type PickleDecodeFn = fn(&mut Vm, &PickleNode) -> RunResult<Value>;

/// Registry of user-type codecs, keyed by type name.
#[derive(Default)]
pub struct PickleRegistry {
    codecs: AHashMap<String, (PickleEncodeFn, PickleDecodeFn)>,
}

impl PickleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for PickleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PickleRegistry").field("codecs", &self.codecs.len()).finish()
    }
}

impl Vm {
    /// Registers a codec for a user type, making it picklable.
    pub fn register_pickle_codec(&mut self, type_name: &str, encode: PickleEncodeFn, decode: PickleDecodeFn) {
        self.pickle.codecs.insert(type_name.to_owned(), (encode, decode));
    }

    /// Serialises a value to wire bytes.
    pub fn pickle_dumps(&mut self, v: Value) -> RunResult<Vec<u8>> {
        let node = self.value_to_node(v, 0)?;
        postcard::to_allocvec(&node).map_err(|e| RunError::value_error(format!("pickle failed: {e}")))
    }

    /// Deserialises wire bytes back into a value.
    pub fn pickle_loads(&mut self, bytes: &[u8]) -> RunResult<Value> {
        let node: PickleNode =
            postcard::from_bytes(bytes).map_err(|e| RunError::value_error(format!("unpickle failed: {e}")))?;
        self.node_to_value(&node)
    }

    fn value_to_node(&mut self, v: Value, depth: usize) -> RunResult<PickleNode> {
        if depth > MAX_PICKLE_DEPTH {
            return Err(RunError::value_error("pickle recursion limit exceeded (cyclic value?)"));
        }
        match v {
            Value::Inline(t, _) if t == types::TP_NONE => Ok(PickleNode::None),
            Value::Inline(t, s) if t == types::TP_BOOL => Ok(PickleNode::Bool(s.as_bool())),
            Value::Inline(t, s) if t == types::TP_INT => Ok(PickleNode::Int(s.as_int())),
            Value::Inline(t, s) if t == types::TP_FLOAT => Ok(PickleNode::Float(s.as_float())),
            Value::Inline(t, s) if t == types::TP_VEC2 => {
                let (x, y) = s.as_vec2();
                Ok(PickleNode::Vec2(x, y))
            }
            Value::Inline(t, s) if t == types::TP_VEC2I => {
                let (x, y) = s.as_vec2i();
                Ok(PickleNode::Vec2i(x, y))
            }
            Value::Boxed(t, id) if t == types::TP_STR => {
                let ObjPayload::Str(s) = self.heap.payload(id) else {
                    unreachable!("str tag without str payload");
                };
                Ok(PickleNode::Str(s.to_string()))
            }
            Value::Boxed(t, id) if t == types::TP_LIST => {
                let ObjPayload::List(items) = self.heap.payload(id) else {
                    unreachable!("list tag without list payload");
                };
                let items = items.clone();
                let nodes = items
                    .into_iter()
                    .map(|item| self.value_to_node(item, depth + 1))
                    .collect::<RunResult<Vec<_>>>()?;
                Ok(PickleNode::List(nodes))
            }
            Value::Boxed(t, id) if t == types::TP_TUPLE => {
                let ObjPayload::Tuple(items) = self.heap.payload(id) else {
                    unreachable!("tuple tag without tuple payload");
                };
                let items = items.to_vec();
                let nodes = items
                    .into_iter()
                    .map(|item| self.value_to_node(item, depth + 1))
                    .collect::<RunResult<Vec<_>>>()?;
                Ok(PickleNode::Tuple(nodes))
            }
            Value::Boxed(t, id) if t == types::TP_DICT => {
                let ObjPayload::Dict(d) = self.heap.payload(id) else {
                    unreachable!("dict tag without dict payload");
                };
                let pairs: Vec<(Value, Value)> = d.iter().collect();
                let mut nodes = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    nodes.push((self.value_to_node(k, depth + 1)?, self.value_to_node(v, depth + 1)?));
                }
                Ok(PickleNode::Dict(nodes))
            }
            _ => {
                let type_name = self.type_name(v.type_of()).to_owned();
                if let Some(&(encode, _)) = self.pickle.codecs.get(&type_name) {
                    let data = encode(self, v)?;
                    return Ok(PickleNode::Custom {
                        type_name,
                        data: Box::new(data),
                    });
                }
                Err(RunError::type_error(format!("cannot pickle '{type_name}' object")))
            }
        }
    }

    fn node_to_value(&mut self, node: &PickleNode) -> RunResult<Value> {
        match node {
            PickleNode::None => Ok(Value::NONE),
            PickleNode::Bool(b) => Ok(Value::new_bool(*b)),
            PickleNode::Int(i) => Ok(Value::new_int(*i)),
            PickleNode::Float(f) => Ok(Value::new_float(*f)),
            PickleNode::Str(s) => Ok(self.new_str(s)),
            PickleNode::Vec2(x, y) => Ok(Value::new_vec2(*x, *y)),
            PickleNode::Vec2i(x, y) => Ok(Value::new_vec2i(*x, *y)),
            PickleNode::List(items) => {
                let values = items
                    .iter()
                    .map(|n| self.node_to_value(n))
                    .collect::<RunResult<Vec<_>>>()?;
                Ok(self.new_list(values))
            }
            PickleNode::Tuple(items) => {
                let values = items
                    .iter()
                    .map(|n| self.node_to_value(n))
                    .collect::<RunResult<Vec<_>>>()?;
                Ok(self.new_tuple(values))
            }
            PickleNode::Dict(pairs) => {
                let dict = self.new_dict();
                for (k, v) in pairs {
                    let key = self.node_to_value(k)?;
                    let value = self.node_to_value(v)?;
                    self.dict_set(dict, key, value)?;
                }
                Ok(dict)
            }
            PickleNode::Custom { type_name, data } => {
                let Some(&(_, decode)) = self.pickle.codecs.get(type_name) else {
                    return Err(RunError::type_error(format!(
                        "no pickle codec registered for '{type_name}'"
                    )));
                };
                decode(self, data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut vm = Vm::new();
        for v in [
            Value::NONE,
            Value::new_bool(true),
            Value::new_int(-42),
            Value::new_float(2.75),
            Value::new_vec2(1.0, -2.0),
            Value::new_vec2i(7, 9),
        ] {
            let bytes = vm.pickle_dumps(v).unwrap();
            let back = vm.pickle_loads(&bytes).unwrap();
            assert!(vm.py_eq(v, back).unwrap() || vm.is_identical(v, back));
        }
    }

    #[test]
    fn test_container_round_trip() {
        let mut vm = Vm::new();
        let s = vm.new_str("hello");
        let inner = vm.new_tuple(vec![Value::new_int(1), s]);
        let list = vm.new_list(vec![inner, Value::new_float(0.5)]);
        let dict = vm.new_dict();
        let key = vm.new_str("k");
        vm.dict_set(dict, key, list).unwrap();

        let bytes = vm.pickle_dumps(dict).unwrap();
        let back = vm.pickle_loads(&bytes).unwrap();
        let same_key = vm.new_str("k");
        let back_list = vm.dict_get(back, same_key).unwrap().unwrap();
        assert!(vm.py_eq(list, back_list).unwrap());
    }

    #[test]
    fn test_unpicklable_rejected() {
        let mut vm = Vm::new();
        let range = vm.new_range(0, 5, 1);
        assert!(vm.pickle_dumps(range).is_err());
    }

    #[test]
    fn test_registered_codec_round_trips_user_type() {
        fn encode_range(vm: &mut Vm, v: Value) -> RunResult<PickleNode> {
            let Some(id) = v.as_obj() else {
                return Err(RunError::type_error("expected range"));
            };
            let ObjPayload::Range { start, stop, step } = vm.heap.payload(id) else {
                return Err(RunError::type_error("expected range"));
            };
            Ok(PickleNode::Tuple(vec![
                PickleNode::Int(*start),
                PickleNode::Int(*stop),
                PickleNode::Int(*step),
            ]))
        }
        fn decode_range(vm: &mut Vm, node: &PickleNode) -> RunResult<Value> {
            let PickleNode::Tuple(fields) = node else {
                return Err(RunError::value_error("corrupt range payload"));
            };
            let (PickleNode::Int(start), PickleNode::Int(stop), PickleNode::Int(step)) =
                (&fields[0], &fields[1], &fields[2])
            else {
                return Err(RunError::value_error("corrupt range payload"));
            };
            Ok(vm.new_range(*start, *stop, *step))
        }

        let mut vm = Vm::new();
        vm.register_pickle_codec("range", encode_range, decode_range);
        let range = vm.new_range(2, 12, 3);
        let bytes = vm.pickle_dumps(range).unwrap();
        let back = vm.pickle_loads(&bytes).unwrap();
        let it = vm.py_iter(back).unwrap();
        assert_eq!(vm.py_next(it).unwrap().unwrap().as_int(), Some(2));
        assert_eq!(vm.py_next(it).unwrap().unwrap().as_int(), Some(5));
    }

    #[test]
    fn test_cycle_detected() {
        let mut vm = Vm::new();
        let list = vm.new_list(vec![]);
        if let Some(id) = list.as_obj()
            && let ObjPayload::List(items) = vm.heap.payload_mut(id)
        {
            items.push(list);
        }
        assert!(vm.pickle_dumps(list).is_err());
    }
}
