//! The module registry and import resolution.
//!
//! Modules are created eagerly with `__name__`/`__package__`/`__path__`
//! pre-populated from the dotted registration path, registered once, and
//! owned for the VM's lifetime: the registry is a GC root and entries are
//! never collected or overridden.

use indexmap::IndexMap;

use crate::{
    error::{RunError, RunResult},
    hooks::CompileMode,
    object::{ModuleInfo, ObjPayload},
    types,
    value::Value,
    vm::Vm,
};

/// Name-keyed table of module objects.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    map: IndexMap<String, Value>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<Value> {
        self.map.get(path).copied()
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.map.contains_key(path)
    }

    pub(crate) fn insert(&mut self, path: String, module: Value) {
        let prev = self.map.insert(path, module);
        // overriding would leak the old module for the process lifetime
        assert!(prev.is_none(), "module registered twice");
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Value)> {
        self.map.iter().map(|(k, &v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Vm {
    /// Creates and registers a module object for a dotted path.
    ///
    /// # Panics
    ///
    /// Panics when the path is empty or already registered; both are host
    /// programming errors, mirroring the fatal behavior of the C surface.
    pub fn new_module(&mut self, path: &str) -> Value {
        assert!(!path.is_empty(), "module path cannot be empty");
        assert!(!self.modules.contains(path), "module '{path}' already exists");

        let (package, name) = match path.rfind('.') {
            Some(dot) => (&path[..dot], &path[dot + 1..]),
            None => ("", path),
        };
        let info = ModuleInfo {
            name: name.into(),
            package: package.into(),
            path: path.into(),
        };
        let id = self.heap.alloc_with_attrs(types::TP_MODULE, ObjPayload::Module(info));
        let module = Value::Boxed(types::TP_MODULE, id);

        let name_v = self.new_str(name);
        let package_v = self.new_str(package);
        let path_v = self.new_str(path);
        let n_name = self.interns.intern("__name__");
        let n_package = self.interns.intern("__package__");
        let n_path = self.interns.intern("__path__");
        self.heap.attrs_mut(id).set(n_name, name_v);
        self.heap.attrs_mut(id).set(n_package, package_v);
        self.heap.attrs_mut(id).set(n_path, path_v);

        self.modules.insert(path.to_owned(), module);
        module
    }

    /// A registered module by path.
    #[must_use]
    pub fn get_module(&self, path: &str) -> Option<Value> {
        self.modules.get(path)
    }

    /// Imports a module: registry, then the lazy-import hook, then the
    /// `importfile` hook (module file, then package `__init__`), else
    /// `ImportError`. Relative paths walk up the importing module's path.
    pub fn import_module(&mut self, path: &str) -> RunResult<Value> {
        if path.is_empty() {
            return Err(RunError::value_error("empty module name"));
        }
        if path.starts_with('.') {
            let absolute = self.resolve_relative_import(path)?;
            return self.import_module(&absolute);
        }

        if let Some(module) = self.modules.get(path) {
            return Ok(module);
        }

        if let Some(lazy) = self.hooks.lazyimport
            && let Some(module) = lazy(path)
        {
            return Ok(module);
        }

        let slashed = path.replace('.', std::path::MAIN_SEPARATOR_STR);
        let file_name = format!("{slashed}.py");
        let init_name = format!("{slashed}{}__init__.py", std::path::MAIN_SEPARATOR);
        let source = match (self.hooks.importfile)(&file_name) {
            Some(src) => Some(src),
            None => (self.hooks.importfile)(&init_name),
        };
        let Some(source) = source else {
            return Err(RunError::import_error(format!("module '{path}' not found")));
        };

        let module = self.new_module(path);
        self.exec_source(&source, &file_name, CompileMode::Exec, module)?;
        Ok(module)
    }

    /// Resolves a `.`-prefixed import against the current frame's module.
    fn resolve_relative_import(&mut self, path: &str) -> RunResult<String> {
        let dot_count = path.bytes().take_while(|&b| b == b'.').count();
        let remainder = &path[dot_count..];

        let module = self.frames.last().map(|f| f.module).unwrap_or(self.main);
        let module_path = match module.as_obj().map(|id| self.heap.payload(id)) {
            Some(ObjPayload::Module(info)) => info.path.to_string(),
            _ => String::new(),
        };
        if module_path.is_empty() {
            return Err(RunError::import_error(
                "attempted relative import with no known parent package",
            ));
        }

        let mut components: Vec<&str> = module_path.split('.').collect();
        for _ in 0..dot_count {
            if components.is_empty() {
                return Err(RunError::import_error(
                    "attempted relative import beyond top-level package",
                ));
            }
            components.pop();
        }
        if components.is_empty() && remainder.is_empty() {
            return Err(RunError::import_error(
                "attempted relative import beyond top-level package",
            ));
        }
        let mut absolute = components.join(".");
        if !remainder.is_empty() {
            if !absolute.is_empty() {
                absolute.push('.');
            }
            absolute.push_str(remainder);
        }
        Ok(absolute)
    }

    /// Re-executes a module's source into its existing object. Old globals
    /// survive unless shadowed, matching reload semantics.
    pub fn reload_module(&mut self, module: Value) -> RunResult<Value> {
        let module_path = match module.as_obj().map(|id| self.heap.payload(id)) {
            Some(ObjPayload::Module(info)) => info.path.to_string(),
            _ => return Err(RunError::type_error("reload() argument must be a module")),
        };
        let slashed = module_path.replace('.', std::path::MAIN_SEPARATOR_STR);
        let file_name = format!("{slashed}.py");
        let init_name = format!("{slashed}{}__init__.py", std::path::MAIN_SEPARATOR);
        let source = match (self.hooks.importfile)(&file_name) {
            Some(src) => Some(src),
            None => (self.hooks.importfile)(&init_name),
        };
        let Some(source) = source else {
            return Err(RunError::import_error(format!("module '{module_path}' not found")));
        };
        self.exec_source(&source, &file_name, CompileMode::Reload, module)?;
        Ok(module)
    }
}
