//! Script host
//!
//! The application logic behind a scope runs inside a script host: something
//! that can get, set and call on dynamically shaped objects. Parsing and
//! evaluating source is out of scope here; [`NativeHost`] wires Rust closures
//! in as methods, which is what the CLI demo and tests use.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::scope::{Scope, ScopeKind};
use crate::value::{ObjectRef, Value};

/// Scripting capability consumed by the server
pub trait ScriptHost: Send + Sync {
    /// Read a property
    fn get(&self, ctx: &CallContext, target: &ObjectRef, name: &str) -> Result<Value> {
        Ok(ctx.get(target, name))
    }

    /// Write a property. Observed targets raise a change through `ctx`.
    fn set(&self, ctx: &CallContext, target: &ObjectRef, name: &str, value: Value) -> Result<()> {
        ctx.set(target, name, value).map(|_| ())
    }

    /// Remove a property
    fn delete(&self, ctx: &CallContext, target: &ObjectRef, name: &str) -> Result<()> {
        ctx.delete(target, name).map(|_| ())
    }

    /// Invoke a method
    fn call(&self, ctx: &CallContext, target: &ObjectRef, method: &str, args: &[Value]) -> Result<Value>;

    /// Called once, right after a scope is created and attached to its parent
    fn on_scope_created(&self, _ctx: &CallContext, _scope: &Arc<Scope>) -> Result<()> {
        Ok(())
    }
}

/// Native method implementation
pub type NativeMethod =
    Arc<dyn Fn(&CallContext, &ObjectRef, &[Value]) -> Result<Value> + Send + Sync>;

/// Scope initializer
pub type ScopeInit = Arc<dyn Fn(&CallContext, &Arc<Scope>) -> Result<()> + Send + Sync>;

/// Host whose methods are Rust closures
#[derive(Default, Clone)]
pub struct NativeHost {
    methods: FxHashMap<String, NativeMethod>,
    initializers: FxHashMap<ScopeKind, Vec<ScopeInit>>,
}

impl NativeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method callable from clients
    pub fn method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&CallContext, &ObjectRef, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Run `f` whenever a scope of `kind` is created
    pub fn on_create<F>(mut self, kind: ScopeKind, f: F) -> Self
    where
        F: Fn(&CallContext, &Arc<Scope>) -> Result<()> + Send + Sync + 'static,
    {
        self.initializers.entry(kind).or_default().push(Arc::new(f));
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn into_host(self) -> Arc<dyn ScriptHost> {
        Arc::new(self)
    }
}

impl ScriptHost for NativeHost {
    fn call(&self, ctx: &CallContext, target: &ObjectRef, method: &str, args: &[Value]) -> Result<Value> {
        let f = self
            .methods
            .get(method)
            .ok_or_else(|| Error::reference_error(format!("{} is not a function", method)))?;
        f(ctx, target, args)
    }

    fn on_scope_created(&self, ctx: &CallContext, scope: &Arc<Scope>) -> Result<()> {
        if let Some(inits) = self.initializers.get(&scope.kind()) {
            for init in inits {
                init(ctx, scope)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for NativeHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("NativeHost").field("methods", &names).finish()
    }
}

/// Host with no methods
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyHost;

impl ScriptHost for EmptyHost {
    fn call(&self, _ctx: &CallContext, _target: &ObjectRef, method: &str, _args: &[Value]) -> Result<Value> {
        Err(Error::reference_error(format!("{} is not a function", method)))
    }
}
