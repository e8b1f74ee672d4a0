//! Scope tree
//!
//! Scopes form the hierarchy Application → Session → Page → Element. Each
//! scope is backed by an observed object, so its state is synchronized like
//! any other object, and each child is attached to its parent's object under
//! its own name so that attaching a scope is itself a broadcast change.
//!
//! A Session owns the [`Channel`] of its clients; Pages and Elements use their
//! Session's channel. Children are created with [`Scope::within`], which
//! constructs at most one scope per name even when called concurrently.
//!
//! **Lifecycle:** a scope is Active from creation until [`Scope::dispose`],
//! after which it is Disposed for good and can no longer be looked up.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::channel::Channel;
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::host::ScriptHost;
use crate::identity::ObjectId;
use crate::observe::ObservationEngine;
use crate::value::{ObjectRef, ObservedObject, Value};

/// Level of a scope in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Application,
    Session,
    Page,
    Element,
}

impl ScopeKind {
    /// Whether a scope of this kind may be created inside `parent`
    pub fn fits_under(self, parent: ScopeKind) -> bool {
        matches!(
            (parent, self),
            (ScopeKind::Application, ScopeKind::Session)
                | (ScopeKind::Session, ScopeKind::Page)
                | (ScopeKind::Page, ScopeKind::Element)
                | (ScopeKind::Element, ScopeKind::Element)
        )
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeKind::Application => "application",
            ScopeKind::Session => "session",
            ScopeKind::Page => "page",
            ScopeKind::Element => "element",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Active,
    Disposed,
}

/// A named execution context
pub struct Scope {
    name: String,
    kind: ScopeKind,
    parent: Option<Weak<Scope>>,
    children: DashMap<String, Arc<Scope>>,
    object: ObjectRef,
    channel: Option<Arc<Channel>>,
    engine: Arc<ObservationEngine>,
    host: Arc<dyn ScriptHost>,
    max_clients: usize,
    disposed: AtomicBool,
}

impl Scope {
    /// Create the root scope of an application
    pub fn application(
        name: &str,
        engine: Arc<ObservationEngine>,
        host: Arc<dyn ScriptHost>,
        max_clients: usize,
    ) -> Arc<Scope> {
        let scope = Arc::new(Scope {
            name: name.to_string(),
            kind: ScopeKind::Application,
            parent: None,
            children: DashMap::new(),
            object: ObservedObject::scope_backing(),
            channel: None,
            engine,
            host,
            max_clients,
            disposed: AtomicBool::new(false),
        });
        scope.engine.observe(&Value::Object(scope.object.clone()), None);
        tracing::debug!(app = %name, id = %scope.id(), "application scope created");
        scope
    }

    fn new_child(self: &Arc<Self>, kind: ScopeKind, name: &str) -> Arc<Scope> {
        let channel = match kind {
            ScopeKind::Session => Some(Channel::with_limit(name, self.max_clients)),
            _ => None,
        };
        let child = Arc::new(Scope {
            name: name.to_string(),
            kind,
            parent: Some(Arc::downgrade(self)),
            children: DashMap::new(),
            object: ObservedObject::scope_backing(),
            channel,
            engine: self.engine.clone(),
            host: self.host.clone(),
            max_clients: self.max_clients,
            disposed: AtomicBool::new(false),
        });
        let owner = child.channel();
        child
            .engine
            .observe(&Value::Object(child.object.clone()), owner.as_ref());
        child
    }

    /// Get the child named `name`, creating it as a `kind` scope if missing.
    ///
    /// Exactly one scope is ever constructed per name; concurrent callers all
    /// receive the same instance. A new scope's invocation gate is taken before
    /// it is published, and held while it is attached to this scope's object
    /// and handed to the host's creation hook. Callers that find the scope
    /// already registered pass through that gate before returning, so none of
    /// them sees it half-initialized.
    pub fn within(self: &Arc<Self>, kind: ScopeKind, name: &str) -> Result<Arc<Scope>> {
        if self.is_disposed() {
            return Err(Error::Disposed(format!("{} scope {}", self.kind, self.path())));
        }
        if !kind.fits_under(self.kind) {
            return Err(Error::type_error(format!(
                "a {} scope cannot be created inside a {} scope",
                kind, self.kind
            )));
        }

        let fresh: Arc<Scope>;
        let mut gate = None;
        let child = match self.children.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                fresh = self.new_child(kind, name);
                gate = Some(fresh.object.enter());
                entry.insert(fresh.clone());
                fresh.clone()
            }
        };
        match gate {
            Some(_gate) => {
                tracing::debug!(path = %child.path(), id = %child.id(), kind = %kind, "scope created");
                self.engine.set_property(
                    &self.context(),
                    &self.object,
                    name,
                    Value::Object(child.object.clone()),
                )?;
                let ctx = child.context();
                if let Err(err) = self.host.on_scope_created(&ctx, &child) {
                    tracing::warn!(path = %child.path(), error = %err, "scope initializer failed");
                    ctx.console("error", &err.to_string());
                }
            }
            None => drop(child.object.enter()),
        }
        Ok(child)
    }

    /// Existing child, if any
    pub fn child(&self, name: &str) -> Option<Arc<Scope>> {
        self.children.get(name).map(|entry| entry.value().clone())
    }

    pub fn children(&self) -> Vec<Arc<Scope>> {
        self.children.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn parent(&self) -> Option<Arc<Scope>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Object holding this scope's state
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn id(&self) -> ObjectId {
        self.object.id()
    }

    pub fn host(&self) -> &Arc<dyn ScriptHost> {
        &self.host
    }

    pub fn engine(&self) -> &Arc<ObservationEngine> {
        &self.engine
    }

    /// The channel this scope communicates through: its own for a Session,
    /// the enclosing Session's otherwise
    pub fn channel(&self) -> Option<Arc<Channel>> {
        if let Some(channel) = &self.channel {
            return Some(channel.clone());
        }
        self.parent().and_then(|parent| parent.channel())
    }

    /// Context for server-initiated work in this scope (no caller)
    pub fn context(&self) -> CallContext {
        CallContext::new(self.engine.clone(), self.channel())
    }

    /// Slash-separated names from the root
    pub fn path(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}/{}", parent.path(), self.name),
            None => self.name.clone(),
        }
    }

    /// Read a state property
    pub fn get(&self, name: &str) -> Value {
        self.object.get(name).unwrap_or_default()
    }

    /// Write a state property from server-side code, broadcasting the change
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.context().set(&self.object, name, value).map(|_| ())
    }

    pub fn state(&self) -> ScopeState {
        if self.is_disposed() {
            ScopeState::Disposed
        } else {
            ScopeState::Active
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Tear down this scope and everything below it.
    ///
    /// The scope leaves its parent's registry and object graph, its children
    /// are disposed recursively, its object stops being observed and, for a
    /// Session, its channel drops every client.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(path = %self.path(), kind = %self.kind, "disposing scope");
        if let Some(channel) = &self.channel {
            channel.dispose();
        }

        let children: Vec<Arc<Scope>> = self.children();
        self.children.clear();
        for child in children {
            child.dispose();
        }

        if let Some(parent) = self.parent() {
            parent
                .children
                .remove_if(&self.name, |_, existing| std::ptr::eq(existing.as_ref(), self));
            if !parent.is_disposed() {
                if let Err(err) =
                    self.engine
                        .delete_property(&parent.context(), &parent.object, &self.name)
                {
                    tracing::warn!(path = %self.path(), error = %err, "failed to detach scope");
                }
            }
        }
        self.engine.release_scope(&self.object);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("path", &self.path())
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("children", &self.children.len())
            .field("state", &self.state())
            .finish()
    }
}
