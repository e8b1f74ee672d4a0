//! Per-request call context
//!
//! Every inbound handshake, query and notify is serviced under a
//! [`CallContext`] naming the channel events go to, the link that issued the
//! request, and the (object, property) pairs whose echo must not be sent back
//! to that link. The context is created when the request arrives and dropped
//! when it completes, so nothing leaks into the next request. Work that
//! outlives the request (a spawned thread, a deferred callback) must be handed
//! a clone of the context explicitly.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::channel::Channel;
use crate::error::Result;
use crate::identity::ObjectId;
use crate::link::{ClientLink, LinkId};
use crate::observe::{ChangeEvent, ObservationEngine};
use crate::value::{ObjectRef, Value};

struct ContextInner {
    engine: Arc<ObservationEngine>,
    channel: Option<Arc<Channel>>,
    caller: Option<Arc<dyn ClientLink>>,
    suppressed: Mutex<FxHashSet<(ObjectId, String)>>,
}

/// Channel, caller and echo-suppression state of one logical operation
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

impl CallContext {
    /// Context with no caller, e.g. for server-initiated work inside a scope.
    /// Events are dropped when `channel` is `None`.
    pub fn new(engine: Arc<ObservationEngine>, channel: Option<Arc<Channel>>) -> Self {
        Self::build(engine, channel, None)
    }

    /// Context for a request issued by `caller`
    pub fn for_caller(
        engine: Arc<ObservationEngine>,
        channel: Option<Arc<Channel>>,
        caller: Arc<dyn ClientLink>,
    ) -> Self {
        Self::build(engine, channel, Some(caller))
    }

    fn build(
        engine: Arc<ObservationEngine>,
        channel: Option<Arc<Channel>>,
        caller: Option<Arc<dyn ClientLink>>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                engine,
                channel,
                caller,
                suppressed: Mutex::new(FxHashSet::default()),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<ObservationEngine> {
        &self.inner.engine
    }

    pub fn channel(&self) -> Option<&Arc<Channel>> {
        self.inner.channel.as_ref()
    }

    pub fn caller(&self) -> Option<&Arc<dyn ClientLink>> {
        self.inner.caller.as_ref()
    }

    pub fn caller_id(&self) -> Option<LinkId> {
        self.inner.caller.as_ref().map(|link| link.id())
    }

    /// Withhold the echo of `(target, name)` from the caller for the rest of
    /// this operation
    pub fn ignore_for_caller(&self, target: ObjectId, name: &str) {
        self.inner.suppressed.lock().insert((target, name.to_string()));
    }

    /// Whether a change to `(target, name)` must be withheld from `link`
    pub fn is_suppressed_for(&self, link: LinkId, target: ObjectId, name: &str) -> bool {
        if self.caller_id() != Some(link) {
            return false;
        }
        self.inner
            .suppressed
            .lock()
            .contains(&(target, name.to_string()))
    }

    /// Read a property
    pub fn get(&self, target: &ObjectRef, name: &str) -> Value {
        target.get(name).unwrap_or_default()
    }

    /// Write a property through the observation engine
    pub fn set(&self, target: &ObjectRef, name: &str, value: impl Into<Value>) -> Result<Option<ChangeEvent>> {
        self.inner.engine.set_property(self, target, name, value.into())
    }

    /// Delete a property through the observation engine
    pub fn delete(&self, target: &ObjectRef, name: &str) -> Result<Option<ChangeEvent>> {
        self.inner.engine.delete_property(self, target, name)
    }

    /// Broadcast a custom event. Returns the number of links reached.
    pub fn emit(&self, target: ObjectId, name: &str, value: &Value) -> usize {
        match &self.inner.channel {
            Some(channel) => channel.emit(self, target, name, value),
            None => 0,
        }
    }

    /// Broadcast console output to every client of the bound channel
    pub fn console(&self, level: &str, message: &str) -> usize {
        match &self.inner.channel {
            Some(channel) => channel.console(level, message),
            None => 0,
        }
    }

    pub(crate) fn publish(&self, event: &ChangeEvent) {
        match &self.inner.channel {
            Some(channel) => {
                channel.publish_change(self, event);
            }
            None => {
                tracing::trace!(target_id = %event.target, name = %event.name, "no channel bound, change dropped");
            }
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("channel", &self.inner.channel.as_ref().map(|c| c.session().to_string()))
            .field("caller", &self.caller_id())
            .field("suppressed", &self.inner.suppressed.lock().len())
            .finish()
    }
}
