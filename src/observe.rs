//! Object observation
//!
//! [`ObservationEngine::observe`] instruments an object graph: every object or
//! array reachable from the root is flagged observed and registered in the
//! [`IdentityMap`] together with its owning channel. Mutations made through
//! [`ObservationEngine::set_property`] and [`ObservationEngine::delete_property`]
//! on an observed object are classified as Put, Set or Delete, keep the
//! observed subgraph in step (new object values are observed, replaced or
//! removed ones are ignored) and are handed to the channel bound in the
//! caller's [`CallContext`].
//!
//! Cascades walk the graph iteratively and stop at objects whose flag is
//! already in the requested state, so shared and cyclic subgraphs are visited
//! once. Objects backing a scope are never unobserved by a cascade; they stay
//! addressable until the scope itself is disposed.

use std::fmt;
use std::sync::Arc;

use crate::channel::Channel;
use crate::context::CallContext;
use crate::error::Result;
use crate::identity::{IdentityMap, ObjectId};
use crate::protocol::EventType;
use crate::value::{Mutation, ObjectRef, ShapeKind, Value};

/// Classification of a property mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// The property did not previously hold a value
    Put,
    /// The property held a different value
    Set,
    /// The property's value was removed
    Delete,
}

impl ChangeType {
    pub fn event_type(self) -> EventType {
        match self {
            ChangeType::Put => EventType::PropertyPut,
            ChangeType::Set => EventType::PropertySet,
            ChangeType::Delete => EventType::PropertyDelete,
        }
    }

    /// Map a wire event type back to a change. `PropertyChange` reads as a Set.
    pub fn from_event_type(event: EventType) -> Option<Self> {
        match event {
            EventType::PropertyPut => Some(ChangeType::Put),
            EventType::PropertySet | EventType::PropertyChange => Some(ChangeType::Set),
            EventType::PropertyDelete => Some(ChangeType::Delete),
            EventType::Custom | EventType::Console => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Put => write!(f, "put"),
            ChangeType::Set => write!(f, "set"),
            ChangeType::Delete => write!(f, "delete"),
        }
    }
}

/// A classified property mutation on an observed object
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub change: ChangeType,
    pub target: ObjectId,
    pub name: String,
    /// New value; `None` for deletes
    pub value: Option<Value>,
}

/// Instruments object graphs and classifies their mutations
#[derive(Debug, Default)]
pub struct ObservationEngine {
    identities: Arc<IdentityMap>,
}

impl ObservationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(identities: Arc<IdentityMap>) -> Self {
        Self { identities }
    }

    pub fn identities(&self) -> &Arc<IdentityMap> {
        &self.identities
    }

    /// Mark `value` and everything reachable from it as observed, registering
    /// each newly observed object under `channel`. Returns how many objects
    /// were newly observed; primitives and already observed subtrees count zero.
    pub fn observe(&self, value: &Value, channel: Option<&Arc<Channel>>) -> usize {
        let Some(root) = value.as_object() else {
            return 0;
        };
        let mut count = 0;
        let mut pending = vec![root.clone()];
        while let Some(obj) = pending.pop() {
            if obj.swap_observed(true) {
                continue;
            }
            self.identities.register(&obj, channel);
            count += 1;
            pending.extend(obj.shape().children());
        }
        count
    }

    /// Inverse of [`observe`](Self::observe), except that scope-backing
    /// objects stay observed. Those are only released when their scope is
    /// disposed, see [`release_scope`](Self::release_scope).
    pub fn ignore(&self, value: &Value) -> usize {
        let Some(root) = value.as_object() else {
            return 0;
        };
        self.unobserve(root, false)
    }

    /// Stop observing a disposed scope's object and everything reachable
    /// from it other than other scopes
    pub(crate) fn release_scope(&self, object: &ObjectRef) -> usize {
        self.unobserve(object, true)
    }

    fn unobserve(&self, root: &ObjectRef, release_root: bool) -> usize {
        let mut count = 0;
        let mut pending = vec![root.clone()];
        while let Some(obj) = pending.pop() {
            let pinned = obj.kind() == ShapeKind::Scope && !(release_root && Arc::ptr_eq(&obj, root));
            if pinned || !obj.swap_observed(false) {
                continue;
            }
            self.identities.unregister(obj.id());
            count += 1;
            pending.extend(obj.shape().children());
        }
        count
    }

    /// Write a property, raising a Put or Set when `target` is observed.
    ///
    /// Writing a value identical to the current one changes nothing and raises
    /// no event.
    pub fn set_property(
        &self,
        ctx: &CallContext,
        target: &ObjectRef,
        name: &str,
        value: Value,
    ) -> Result<Option<ChangeEvent>> {
        let mutation = target.shape().write(name, value.clone())?;
        let change = match mutation {
            Mutation::Unchanged | Mutation::Delete { .. } => return Ok(None),
            Mutation::Put => ChangeType::Put,
            Mutation::Set { ref old } => {
                if target.is_observed() {
                    self.ignore(old);
                }
                ChangeType::Set
            }
        };
        if !target.is_observed() {
            return Ok(None);
        }
        self.observe(&value, self.owner_channel(target).as_ref());
        let event = ChangeEvent {
            change,
            target: target.id(),
            name: name.to_string(),
            value: Some(value),
        };
        ctx.publish(&event);
        Ok(Some(event))
    }

    /// Remove a property, raising a Delete when `target` is observed and the
    /// property held a value.
    pub fn delete_property(
        &self,
        ctx: &CallContext,
        target: &ObjectRef,
        name: &str,
    ) -> Result<Option<ChangeEvent>> {
        let old = match target.shape().remove(name)? {
            Mutation::Delete { old } => old,
            _ => return Ok(None),
        };
        if !target.is_observed() {
            return Ok(None);
        }
        self.ignore(&old);
        let event = ChangeEvent {
            change: ChangeType::Delete,
            target: target.id(),
            name: name.to_string(),
            value: None,
        };
        ctx.publish(&event);
        Ok(Some(event))
    }

    fn owner_channel(&self, target: &ObjectRef) -> Option<Arc<Channel>> {
        self.identities
            .resolve_with_channel(target.id())
            .and_then(|(_, channel)| channel)
    }
}
