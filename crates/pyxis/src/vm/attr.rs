//! Attribute protocol: name resolution, the type-chain walk, and the
//! descriptor protocol.
//!
//! Resolution order on a value: magic slot, then the instance dictionary,
//! then each type in the base chain. Descriptors found on types are
//! applied: functions bind into bound methods, properties invoke their
//! getter, classmethods rebind to the class, staticmethods unwrap.

use crate::{
    error::{RunError, RunResult},
    intern::Name,
    object::ObjPayload,
    types::{self, MagicSlot, TypeId},
    value::Value,
    vm::Vm,
};

impl Vm {
    /// Allocates a bound method.
    pub(crate) fn new_bound_method(&mut self, func: Value, receiver: Value) -> Value {
        let id = self
            .heap
            .alloc(types::TP_BOUNDMETHOD, ObjPayload::BoundMethod { func, receiver });
        Value::Boxed(types::TP_BOUNDMETHOD, id)
    }

    /// Attribute lookup on `v`.
    pub fn py_getattr(&mut self, v: Value, name: Name) -> RunResult<Value> {
        // super() proxies redirect the walk to start above their type
        if v.type_of() == types::TP_SUPER {
            return self.super_getattr(v, name);
        }
        // type objects resolve against the type they stand for
        if let Some(tid) = self.as_type_id(v) {
            return self.type_getattr(tid, name);
        }

        // 1. magic names answer from the slot array (unbound)
        if let Some(slot) = name.as_magic()
            && let Some(f) = self.magic_of(v.type_of(), slot)
        {
            return Ok(f);
        }

        // 2. the instance dictionary
        if let Some(id) = v.as_obj()
            && let Some(attrs) = self.heap.attrs(id)
            && let Some(found) = attrs.get(name)
        {
            return Ok(found);
        }

        // 3. the type chain, applying the descriptor protocol
        if let Some(found) = self.lookup_type_chain(v.type_of(), name) {
            return self.apply_descriptor(found, v);
        }

        Err(RunError::attribute_error(
            self.type_name(v.type_of()).to_owned(),
            self.interns.str_of(name),
        ))
    }

    /// Walks the base chain looking for `name` in each type's dictionary.
    pub(crate) fn lookup_type_chain(&self, start: TypeId, name: Name) -> Option<Value> {
        let mut t = start;
        loop {
            let info = self.types.get(t);
            if let Some(id) = info.self_value.as_obj()
                && let Some(attrs) = self.heap.attrs(id)
                && let Some(found) = attrs.get(name)
            {
                return Some(found);
            }
            if t == types::TP_OBJECT {
                return None;
            }
            t = info.base;
            if t == types::TP_NIL {
                return None;
            }
        }
    }

    /// Applies the descriptor protocol for a value found on a type, with
    /// `receiver` as the instance.
    fn apply_descriptor(&mut self, found: Value, receiver: Value) -> RunResult<Value> {
        match found {
            Value::Boxed(t, id) if t == types::TP_PROPERTY => {
                let ObjPayload::Property { getter, .. } = self.heap.payload(id) else {
                    unreachable!("property tag without property payload");
                };
                let getter = *getter;
                if getter.is_nil() {
                    return Err(RunError::attribute_error("property", "getter"));
                }
                self.call_value(getter, &[receiver])
            }
            Value::Boxed(t, id) if t == types::TP_STATICMETHOD => {
                let ObjPayload::StaticMethod(inner) = self.heap.payload(id) else {
                    unreachable!("staticmethod tag without payload");
                };
                Ok(*inner)
            }
            Value::Boxed(t, id) if t == types::TP_CLASSMETHOD => {
                let ObjPayload::ClassMethod(inner) = self.heap.payload(id) else {
                    unreachable!("classmethod tag without payload");
                };
                let inner = *inner;
                let cls = self.types.get(receiver.type_of()).self_value;
                Ok(self.new_bound_method(inner, cls))
            }
            Value::Boxed(t, _) if t == types::TP_FUNCTION || t == types::TP_NATIVEFUNC => {
                Ok(self.new_bound_method(found, receiver))
            }
            other => Ok(other),
        }
    }

    /// Attribute lookup on a type object (`A.f`): the type's own chain,
    /// without instance binding.
    fn type_getattr(&mut self, tid: TypeId, name: Name) -> RunResult<Value> {
        if let Some(slot) = name.as_magic()
            && let Some(f) = self.magic_of(tid, slot)
        {
            return Ok(f);
        }
        if let Some(found) = self.lookup_type_chain(tid, name) {
            return match found {
                Value::Boxed(t, id) if t == types::TP_CLASSMETHOD => {
                    let ObjPayload::ClassMethod(inner) = self.heap.payload(id) else {
                        unreachable!("classmethod tag without payload");
                    };
                    let inner = *inner;
                    let cls = self.types.get(tid).self_value;
                    Ok(self.new_bound_method(inner, cls))
                }
                Value::Boxed(t, id) if t == types::TP_STATICMETHOD => {
                    let ObjPayload::StaticMethod(inner) = self.heap.payload(id) else {
                        unreachable!("staticmethod tag without payload");
                    };
                    Ok(*inner)
                }
                other => Ok(other),
            };
        }
        let type_name = self.type_name(tid).to_owned();
        Err(RunError::attribute_error(format!("type[{type_name}]"), self.interns.str_of(name)))
    }

    /// `super(T, obj).name`: walk from `T`'s base, bind to `obj`.
    fn super_getattr(&mut self, sup: Value, name: Name) -> RunResult<Value> {
        let Some(id) = sup.as_obj() else {
            unreachable!("super tag on inline value");
        };
        let ObjPayload::Super { start, receiver } = self.heap.payload(id) else {
            unreachable!("super tag without super payload");
        };
        let (start, receiver) = (*start, *receiver);
        if let Some(slot) = name.as_magic()
            && let Some(f) = self.magic_of(start, slot)
        {
            return self.apply_descriptor(f, receiver);
        }
        if let Some(found) = self.lookup_type_chain(start, name) {
            return self.apply_descriptor(found, receiver);
        }
        Err(RunError::attribute_error("super", self.interns.str_of(name)))
    }

    /// Attribute assignment.
    pub fn py_setattr(&mut self, obj: Value, name: Name, value: Value) -> RunResult<()> {
        // writing to a type object updates its dictionary, and magic names
        // also refresh the dispatch slot
        if let Some(tid) = self.as_type_id(obj) {
            if let Some(slot) = name.as_magic() {
                self.types.get_mut(tid).set_magic_slot(slot, value);
            }
            let id = obj.as_obj().expect("type object is boxed");
            self.heap.attrs_mut(id).set(name, value);
            return Ok(());
        }
        // a property with a setter takes precedence over the instance dict
        if let Some(found) = self.lookup_type_chain(obj.type_of(), name)
            && let Value::Boxed(t, id) = found
            && t == types::TP_PROPERTY
        {
            let ObjPayload::Property { setter, .. } = self.heap.payload(id) else {
                unreachable!("property tag without property payload");
            };
            let setter = *setter;
            if setter.is_nil() {
                return Err(RunError::attribute_error(
                    self.type_name(obj.type_of()).to_owned(),
                    self.interns.str_of(name),
                ));
            }
            self.call_value(setter, &[obj, value])?;
            return Ok(());
        }
        match obj.as_obj() {
            Some(id) if self.heap.get(id).attrs.is_some() || self.types.get(obj.type_of()).is_python => {
                self.heap.attrs_mut(id).set(name, value);
                Ok(())
            }
            _ => Err(RunError::type_error(format!(
                "cannot set attribute '{}' on '{}' object",
                self.interns.str_of(name),
                self.type_name(obj.type_of())
            ))),
        }
    }

    /// Attribute deletion.
    pub fn py_delattr(&mut self, obj: Value, name: Name) -> RunResult<()> {
        if let Some(id) = obj.as_obj()
            && let Some(attrs) = self.heap.get_mut(id).attrs.as_deref_mut()
            && attrs.delete(name)
        {
            return Ok(());
        }
        Err(RunError::attribute_error(
            self.type_name(obj.type_of()).to_owned(),
            self.interns.str_of(name),
        ))
    }

    // ------------------------------------------------------------------
    // Name resolution (LoadName / LoadGlobal chains)
    // ------------------------------------------------------------------

    /// An attribute of a module object (globals access).
    #[must_use]
    pub fn module_attr(&self, module: Value, name: Name) -> Option<Value> {
        let id = module.as_obj()?;
        self.heap.attrs(id)?.get(name)
    }

    /// Writes a module attribute (global assignment).
    pub fn set_module_attr(&mut self, module: Value, name: Name, value: Value) {
        let id = module.as_obj().expect("module is boxed");
        self.heap.attrs_mut(id).set(name, value);
    }

    /// Convenience for hosts and tests: a global of `__main__` by string.
    #[must_use]
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let name = self.interns.try_get(name)?;
        self.module_attr(self.main, name)
    }

    /// A `builtins` module attribute by string.
    #[must_use]
    pub fn get_builtin(&self, name: &str) -> Option<Value> {
        let name = self.interns.try_get(name)?;
        self.module_attr(self.builtins, name)
    }

    /// String-keyed attribute lookup, for hosts.
    pub fn getattr_by_name(&mut self, v: Value, name: &str) -> RunResult<Value> {
        let name = self.interns.intern(name);
        self.py_getattr(v, name)
    }

    /// Convenience for hosts: sets a global of `__main__`.
    pub fn set_global(&mut self, name: &str, value: Value) {
        let name = self.interns.intern(name);
        self.set_module_attr(self.main, name, value);
    }

    /// `LoadName`: closure, then the frame's module globals, then builtins.
    pub(crate) fn load_name(&mut self, idx: u16) -> RunResult<Value> {
        let frame = self.current_frame();
        let name = frame.names[usize::from(idx)];
        let module = frame.module;
        let callable = frame.callable;

        if let Some(fid) = callable.as_obj()
            && let ObjPayload::Function(func) = self.heap.payload(fid)
            && let Some(closure) = &func.closure
            && let Some(v) = closure.get(name)
        {
            return Ok(v);
        }
        if let Some(v) = self.module_attr(module, name) {
            return Ok(v);
        }
        if let Some(v) = self.module_attr(self.builtins, name) {
            return Ok(v);
        }
        Err(RunError::name_error(self.interns.str_of(name)))
    }

    /// `LoadGlobal`: the frame's module globals, then builtins.
    pub(crate) fn load_global(&mut self, idx: u16) -> RunResult<Value> {
        let frame = self.current_frame();
        let name = frame.names[usize::from(idx)];
        let module = frame.module;
        if let Some(v) = self.module_attr(module, name) {
            return Ok(v);
        }
        if let Some(v) = self.module_attr(self.builtins, name) {
            return Ok(v);
        }
        Err(RunError::name_error(self.interns.str_of(name)))
    }

    /// `DeleteName` / `DeleteGlobal`.
    pub(crate) fn delete_global(&mut self, idx: u16) -> RunResult<()> {
        let frame = self.current_frame();
        let name = frame.names[usize::from(idx)];
        let module = frame.module;
        let id = module.as_obj().expect("module is boxed");
        if let Some(attrs) = self.heap.get_mut(id).attrs.as_deref_mut()
            && attrs.delete(name)
        {
            return Ok(());
        }
        Err(RunError::name_error(self.interns.str_of(name)))
    }

    // ------------------------------------------------------------------
    // isinstance / issubclass
    // ------------------------------------------------------------------

    /// `isinstance(v, cls)` where `cls` is a type object or tuple of them.
    pub fn py_isinstance(&mut self, v: Value, cls: Value) -> RunResult<bool> {
        self.check_class_match(v.type_of(), cls)
    }

    /// `issubclass(a, cls)` over type objects.
    pub fn py_issubclass(&mut self, a: Value, cls: Value) -> RunResult<bool> {
        let tid = self
            .as_type_id(a)
            .ok_or_else(|| RunError::type_error("issubclass() arg 1 must be a class"))?;
        self.check_class_match_from(tid, cls)
    }

    fn check_class_match(&mut self, tid: crate::types::TypeId, cls: Value) -> RunResult<bool> {
        self.check_class_match_from(tid, cls)
    }

    fn check_class_match_from(&mut self, tid: crate::types::TypeId, cls: Value) -> RunResult<bool> {
        if let Some(target) = self.as_type_id(cls) {
            return Ok(self.types.issubclass(tid, target));
        }
        if let Some(id) = cls.as_obj()
            && let ObjPayload::Tuple(items) = self.heap.payload(id)
        {
            let items = items.to_vec();
            for item in items {
                if self.check_class_match_from(tid, item)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        Err(RunError::type_error("isinstance() arg 2 must be a type or tuple of types"))
    }

    /// Calls a magic slot, raising `TypeError` when the slot is empty.
    pub(crate) fn call_magic_required(&mut self, slot: MagicSlot, args: &[Value]) -> RunResult<Value> {
        let receiver = args[0];
        match self.magic_of(receiver.type_of(), slot) {
            Some(f) => self.call_value(f, args),
            None => Err(RunError::type_error(format!(
                "'{}' object does not support {}",
                self.type_name(receiver.type_of()),
                slot.as_str()
            ))),
        }
    }
}
