//! The vectorcall calling convention.
//!
//! Callers lay out `[callable, arg0..argN, key0, val0, ..]` on the operand
//! stack and dispatch on the callable's type: native functions run in
//! place against the stack window; user functions bind arguments into a
//! fresh frame; type objects construct instances; bound methods re-splice
//! their receiver and recurse. Keyword arguments are matched against
//! parameter names through the VM's scratch buffer.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    bytecode::code::{Code, FuncDecl},
    error::{RunError, RunResult},
    frame::Frame,
    object::{Function, GeneratorState, NameDict, ObjPayload},
    types::{self, MagicSlot},
    value::{HeapId, Value},
    vm::{FrameSignal, MAX_CO_VARNAMES, Vm},
};

/// Outcome of a vectorcall dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CallAction {
    /// The call completed; its result has been pushed.
    Returned,
    /// A frame was pushed; the run loop continues inside it.
    FramePushed,
}

impl Vm {
    /// Dispatches the call laid out on top of the stack.
    pub(crate) fn vectorcall(&mut self, argc: u16, kwargc: u16) -> RunResult<CallAction> {
        let argc = usize::from(argc);
        let kwargc = usize::from(kwargc);
        let total = 1 + argc + 2 * kwargc;
        let base = self.stack.len() - total;
        let callable = self.stack[base];

        match callable {
            Value::Boxed(t, id) if t == types::TP_NATIVEFUNC => self.call_native(id, base, argc, kwargc),
            Value::Boxed(t, id) if t == types::TP_FUNCTION => self.call_function(callable, id, base, argc, kwargc),
            Value::Boxed(t, _) if t == types::TP_TYPE => self.call_type(callable, base, argc, kwargc),
            Value::Boxed(t, id) if t == types::TP_BOUNDMETHOD => {
                let ObjPayload::BoundMethod { func, receiver } = self.heap.payload(id) else {
                    unreachable!("boundmethod tag without payload");
                };
                let (func, receiver) = (*func, *receiver);
                self.stack[base] = func;
                self.stack.insert(base + 1, receiver);
                self.vectorcall((argc + 1).try_into().expect("argc fits u16"), kwargc as u16)
            }
            Value::Boxed(t, id) if t == types::TP_STATICMETHOD => {
                let ObjPayload::StaticMethod(inner) = self.heap.payload(id) else {
                    unreachable!("staticmethod tag without payload");
                };
                self.stack[base] = *inner;
                self.vectorcall(argc as u16, kwargc as u16)
            }
            Value::Boxed(t, id) if t == types::TP_CLASSMETHOD => {
                let ObjPayload::ClassMethod(inner) = self.heap.payload(id) else {
                    unreachable!("classmethod tag without payload");
                };
                self.stack[base] = *inner;
                self.vectorcall(argc as u16, kwargc as u16)
            }
            _ => match self.magic_of(callable.type_of(), MagicSlot::Call) {
                Some(f) => {
                    self.stack[base] = f;
                    self.stack.insert(base + 1, callable);
                    self.vectorcall((argc + 1).try_into().expect("argc fits u16"), kwargc as u16)
                }
                None => Err(RunError::type_error(format!(
                    "'{}' object is not callable",
                    self.type_name(callable.type_of())
                ))),
            },
        }
    }

    /// Runs a native function against the stack window in place. On
    /// success the window is replaced by the retval.
    fn call_native(&mut self, id: HeapId, base: usize, argc: usize, kwargc: usize) -> RunResult<CallAction> {
        let ObjPayload::NativeFunc(nf) = self.heap.payload(id) else {
            unreachable!("nativefunc tag without payload");
        };
        let nf = *nf;
        let saved_base = self.native_base;
        self.native_base = base + 1;
        let result = (nf.func)(self, argc, kwargc);
        self.native_base = saved_base;
        result?;
        let rv = self.retval;
        self.stack.truncate(base);
        self.push(rv);
        Ok(CallAction::Returned)
    }

    /// Binds a user function's arguments and pushes its frame (or builds a
    /// generator object for generator functions).
    fn call_function(&mut self, callable: Value, id: HeapId, base: usize, argc: usize, kwargc: usize) -> RunResult<CallAction> {
        let ObjPayload::Function(func) = self.heap.payload(id) else {
            unreachable!("function tag without payload");
        };
        let decl = func.decl.clone();
        let module = func.module;
        let defaults = func.defaults.clone();

        let bound = self.bind_args(&decl, &defaults, base + 1, argc, kwargc)?;
        // the scratch buffer keeps bound values rooted between stack
        // truncation and frame installation
        self.scratch.clear();
        self.scratch.extend_from_slice(&bound);

        if decl.is_generator {
            let names = self.intern_name_pool(&decl.code);
            let mut frame = Frame::new(decl.code.clone(), module, callable, 0, names);
            frame.locals[..self.scratch.len()].copy_from_slice(&self.scratch);
            let gid = self
                .heap
                .alloc(types::TP_GENERATOR, ObjPayload::Generator(Box::new(GeneratorState::Running)));
            frame.gen_slot = Some(gid);
            self.set_generator_state(
                gid,
                GeneratorState::Suspended {
                    frame: Box::new(frame),
                    saved_stack: Vec::new(),
                },
            );
            self.scratch.clear();
            self.stack.truncate(base);
            self.push(Value::Boxed(types::TP_GENERATOR, gid));
            return Ok(CallAction::Returned);
        }

        if self.frames.len() >= self.recursion_limit {
            self.scratch.clear();
            return Err(RunError::recursion_error());
        }
        self.stack.truncate(base);
        let names = self.intern_name_pool(&decl.code);
        let mut frame = Frame::new(decl.code.clone(), module, callable, self.stack.len(), names);
        frame.locals[..self.scratch.len()].copy_from_slice(&self.scratch);
        self.scratch.clear();
        self.frames.push(frame);
        Ok(CallAction::FramePushed)
    }

    /// Constructor call on a type object: native `__new__` when the type
    /// provides one, otherwise allocate an instance and run `__init__`.
    fn call_type(&mut self, callable: Value, base: usize, argc: usize, kwargc: usize) -> RunResult<CallAction> {
        let tid = self.as_type_id(callable).expect("type tag without TypeRef payload");
        let info = self.types.get(tid);

        // a native __new__ (own or inherited, e.g. exception subclasses)
        // builds the instance itself, receiving the class as argument 0
        if let Some(new_fn) = info.magic_slot(MagicSlot::New)
            && new_fn.type_of() == types::TP_NATIVEFUNC
        {
            self.stack[base] = new_fn;
            self.stack.insert(base + 1, callable);
            return self.vectorcall((argc + 1).try_into().expect("argc fits u16"), kwargc as u16);
        }
        if !info.is_python {
            return Err(RunError::type_error(format!(
                "cannot create '{}' instances",
                self.type_name(tid)
            )));
        }

        let inst_id = self.heap.alloc_with_attrs(tid, ObjPayload::Instance);
        let inst = Value::Boxed(tid, inst_id);

        match self.magic_of(tid, MagicSlot::Init) {
            Some(init) => {
                self.stack[base] = init;
                self.stack.insert(base + 1, inst);
                match self.vectorcall((argc + 1).try_into().expect("argc fits u16"), kwargc as u16)? {
                    CallAction::Returned => {
                        // discard __init__'s None, produce the instance
                        self.pop();
                        self.push(inst);
                        Ok(CallAction::Returned)
                    }
                    CallAction::FramePushed => {
                        self.current_frame_mut().init_instance = inst;
                        Ok(CallAction::FramePushed)
                    }
                }
            }
            None => {
                if argc > 0 || kwargc > 0 {
                    return Err(RunError::type_error(format!(
                        "{}() takes no arguments",
                        self.type_name(tid)
                    )));
                }
                self.stack.truncate(base);
                self.push(inst);
                Ok(CallAction::Returned)
            }
        }
    }

    /// Binds call-site arguments to parameter slots: positional, then
    /// keywords, then defaults, then the required-parameter check.
    fn bind_args(
        &mut self,
        decl: &Arc<FuncDecl>,
        defaults: &[Value],
        args_base: usize,
        argc: usize,
        kwargc: usize,
    ) -> RunResult<SmallVec<[Value; 16]>> {
        let spec = &decl.params;
        let n_params = spec.param_slot_count();
        if n_params > MAX_CO_VARNAMES {
            return Err(RunError::type_error(format!(
                "{}() declares too many parameters",
                decl.name
            )));
        }
        let n_args = spec.args.len();
        let mut slots: SmallVec<[Value; 16]> = SmallVec::from_elem(Value::NIL, n_params);

        // positional arguments
        let n_positional = argc.min(n_args);
        for i in 0..n_positional {
            slots[i] = self.stack[args_base + i];
        }
        if argc > n_args {
            match spec.var_args_slot() {
                Some(slot) => {
                    let extra: Vec<Value> = self.stack[args_base + n_args..args_base + argc].to_vec();
                    slots[slot] = self.new_tuple(extra);
                }
                None => {
                    return Err(RunError::type_error(format!(
                        "{}() takes {} positional arguments but {} were given",
                        decl.name, n_args, argc
                    )));
                }
            }
        } else if let Some(slot) = spec.var_args_slot() {
            slots[slot] = self.new_tuple(Vec::new());
        }

        // keyword arguments, matched by name
        let kw_dict = match spec.var_kwargs_slot() {
            Some(slot) => {
                let d = self.new_dict();
                slots[slot] = d;
                Some(d)
            }
            None => None,
        };
        for k in 0..kwargc {
            let key = self.stack[args_base + argc + 2 * k];
            let value = self.stack[args_base + argc + 2 * k + 1];
            let Some(key_str) = self.str_of(key).map(str::to_owned) else {
                return Err(RunError::type_error("keywords must be strings"));
            };
            if let Some(pos) = spec.args.iter().position(|p| *p == key_str) {
                if pos < n_positional || !slots[pos].is_nil() {
                    return Err(RunError::type_error(format!(
                        "{}() got multiple values for argument '{key_str}'",
                        decl.name
                    )));
                }
                slots[pos] = value;
            } else if let Some(kpos) = spec.kwonly.iter().position(|p| *p == key_str) {
                let slot = spec.kwonly_slot(kpos);
                if !slots[slot].is_nil() {
                    return Err(RunError::type_error(format!(
                        "{}() got multiple values for argument '{key_str}'",
                        decl.name
                    )));
                }
                slots[slot] = value;
            } else if let Some(d) = kw_dict {
                self.dict_set(d, key, value)?;
            } else {
                return Err(RunError::type_error(format!(
                    "{}() got an unexpected keyword argument '{key_str}'",
                    decl.name
                )));
            }
        }

        // positional defaults fill the still-empty tail
        let first_default = n_args - spec.arg_defaults_count;
        for (j, slot) in slots.iter_mut().enumerate().take(n_args).skip(first_default) {
            if slot.is_nil() {
                *slot = defaults[j - first_default];
            }
        }
        // keyword-only defaults live after the positional section
        for (i, default_idx) in spec.kwonly_default_map.iter().enumerate() {
            let slot = spec.kwonly_slot(i);
            if slots[slot].is_nil()
                && let Some(di) = default_idx
            {
                slots[slot] = defaults[spec.arg_defaults_count + di];
            }
        }

        // everything declared must now be bound
        for (j, param) in spec.args.iter().enumerate() {
            if slots[j].is_nil() {
                return Err(RunError::type_error(format!(
                    "{}() missing required argument: '{param}'",
                    decl.name
                )));
            }
        }
        for (i, param) in spec.kwonly.iter().enumerate() {
            if slots[spec.kwonly_slot(i)].is_nil() {
                return Err(RunError::type_error(format!(
                    "{}() missing required keyword-only argument: '{param}'",
                    decl.name
                )));
            }
        }
        Ok(slots)
    }

    /// Calls `callable(*args)` reentrantly and returns the result.
    pub fn call_value(&mut self, callable: Value, args: &[Value]) -> RunResult<Value> {
        let base0 = self.stack.len();
        self.push(callable);
        for &a in args {
            self.push(a);
        }
        match self.vectorcall(u16::try_from(args.len()).expect("argc fits u16"), 0) {
            Ok(CallAction::Returned) => Ok(self.pop()),
            Ok(CallAction::FramePushed) => match self.run_top_frame()? {
                FrameSignal::Returned(v) | FrameSignal::Yielded(v) => Ok(v),
            },
            Err(e) => {
                self.stack.truncate(base0);
                Err(e)
            }
        }
    }

    /// `MakeFunction`: materialises a function object, capturing the
    /// enclosing frame's named locals as the closure when the definition
    /// happens inside a function.
    pub(crate) fn make_function(&mut self, code: &Arc<Code>, decl_idx: u16, defaults: Vec<Value>) -> Value {
        let decl = code.decl_at(decl_idx).clone();
        let enclosing_code = self.current_frame().code.clone();
        let module = self.current_frame().module;
        let callable = self.current_frame().callable;

        let closure = if callable.is_nil() {
            None
        } else {
            let mut dict = NameDict::new();
            if let Some(cid) = callable.as_obj()
                && let ObjPayload::Function(f) = self.heap.payload(cid)
                && let Some(c) = &f.closure
            {
                for (n, v) in c.iter() {
                    dict.set(n, v);
                }
            }
            let pairs: Vec<(String, Value)> = enclosing_code
                .varnames()
                .iter()
                .cloned()
                .zip(self.current_frame().locals.iter().copied())
                .filter(|(_, v)| !v.is_nil())
                .collect();
            for (name, v) in pairs {
                let n = self.interns.intern(&name);
                dict.set(n, v);
            }
            Some(Box::new(dict))
        };

        let id = self.heap.alloc(
            types::TP_FUNCTION,
            ObjPayload::Function(Function {
                decl,
                module,
                closure,
                defaults,
            }),
        );
        Value::Boxed(types::TP_FUNCTION, id)
    }

    /// `BuildClass`: creates a user type from a methods dict, installing
    /// magic names into the slot array and the rest into the type's
    /// dictionary.
    pub(crate) fn build_class(&mut self, name_idx: u16, has_base: bool) -> RunResult<Value> {
        let methods = self.pop();
        let base_tid = if has_base {
            let base_val = self.pop();
            self.as_type_id(base_val)
                .ok_or_else(|| RunError::type_error("class base must be a class"))?
        } else {
            types::TP_OBJECT
        };
        let frame = self.current_frame();
        let name = frame.names[usize::from(name_idx)];
        let module = frame.module;

        let tid = self.types.new_type(name, base_tid, module, None, true, false)?;
        let obj_id = self.heap.alloc_with_attrs(types::TP_TYPE, ObjPayload::TypeRef(tid));
        let type_value = Value::Boxed(types::TP_TYPE, obj_id);
        self.types.get_mut(tid).self_value = type_value;

        let entries: Vec<(Value, Value)> = match methods.as_obj().map(|id| self.heap.payload(id)) {
            Some(ObjPayload::Dict(d)) => d.iter().collect(),
            _ => return Err(RunError::type_error("class namespace must be a dict")),
        };
        for (k, v) in entries {
            let Some(key_str) = self.str_of(k).map(str::to_owned) else {
                return Err(RunError::type_error("class member names must be strings"));
            };
            let n = self.interns.intern(&key_str);
            if let Some(slot) = n.as_magic() {
                self.types.get_mut(tid).set_magic_slot(slot, v);
            } else {
                self.heap.attrs_mut(obj_id).set(n, v);
            }
        }
        Ok(type_value)
    }

    /// Resumes a suspended generator. `Ok(None)` means exhausted.
    pub(crate) fn resume_generator(&mut self, gid: HeapId) -> RunResult<Option<Value>> {
        let ObjPayload::Generator(state) = self.heap.payload_mut(gid) else {
            return Err(RunError::type_error("expected a generator"));
        };
        let current = std::mem::replace(state.as_mut(), GeneratorState::Running);
        match current {
            GeneratorState::Done => {
                self.set_generator_state(gid, GeneratorState::Done);
                Ok(None)
            }
            GeneratorState::Running => Err(RunError::value_error("generator already executing")),
            GeneratorState::Suspended { mut frame, saved_stack } => {
                if self.frames.len() >= self.recursion_limit {
                    self.set_generator_state(gid, GeneratorState::Done);
                    return Err(RunError::recursion_error());
                }
                frame.p0 = self.stack.len();
                for v in saved_stack {
                    self.push(v);
                }
                self.frames.push(*frame);
                match self.run_top_frame() {
                    // a yield re-parks the frame before the signal surfaces
                    Ok(FrameSignal::Yielded(v)) => Ok(Some(v)),
                    Ok(FrameSignal::Returned(_)) => Ok(None),
                    Err(e) => {
                        self.set_generator_state(gid, GeneratorState::Done);
                        Err(e)
                    }
                }
            }
        }
    }

}
