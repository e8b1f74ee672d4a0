//! Object identity registry
//!
//! Maps the process-unique id of every observed object to a weak handle on the
//! object and a weak handle on the channel that owns it. An entry exists only
//! while the object is observed; entries whose object (or bound channel) has
//! gone away are evicted the next time they are looked up, or in bulk by
//! [`IdentityMap::sweep`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::value::{ObjectRef, ObservedObject};

/// Process-unique identity of an observed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Allocate the next id. Ids start at 1 and are never reused.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct IdentityEntry {
    object: Weak<ObservedObject>,
    channel: Weak<Channel>,
    /// Whether a channel was bound at registration; an unbound entry never
    /// expires because of its channel.
    has_channel: bool,
}

impl IdentityEntry {
    fn live_object(&self) -> Option<ObjectRef> {
        self.object.upgrade()
    }

    fn live_channel(&self) -> Result<Option<Arc<Channel>>, ()> {
        if !self.has_channel {
            return Ok(None);
        }
        match self.channel.upgrade() {
            Some(channel) if !channel.is_disposed() => Ok(Some(channel)),
            _ => Err(()),
        }
    }
}

/// Registry from object id to (weak object, weak owning channel)
#[derive(Default)]
pub struct IdentityMap {
    entries: DashMap<ObjectId, IdentityEntry>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object under its id, replacing any previous entry
    pub fn register(&self, object: &ObjectRef, channel: Option<&Arc<Channel>>) -> ObjectId {
        let id = object.id();
        let entry = IdentityEntry {
            object: Arc::downgrade(object),
            channel: channel.map(Arc::downgrade).unwrap_or_default(),
            has_channel: channel.is_some(),
        };
        self.entries.insert(id, entry);
        id
    }

    /// Remove an entry. Returns whether one was present.
    pub fn unregister(&self, id: ObjectId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Look up a live object
    pub fn resolve(&self, id: ObjectId) -> Option<ObjectRef> {
        self.resolve_with_channel(id).map(|(object, _)| object)
    }

    /// Look up a live object together with its owning channel, if one was bound.
    ///
    /// A stale entry is removed before returning `None`.
    pub fn resolve_with_channel(&self, id: ObjectId) -> Option<(ObjectRef, Option<Arc<Channel>>)> {
        let found = {
            let entry = self.entries.get(&id)?;
            match (entry.live_object(), entry.live_channel()) {
                (Some(object), Ok(channel)) => Some((object, channel)),
                _ => None,
            }
        };
        if found.is_none() {
            tracing::debug!(%id, "evicting stale identity entry");
            self.entries.remove(&id);
        }
        found
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.resolve_with_channel(id).is_some()
    }

    /// Number of entries, including stale ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose object or channel is gone. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.live_object().is_some() && entry.live_channel().is_ok());
        before.saturating_sub(self.entries.len())
    }
}

impl fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMap")
            .field("entries", &self.entries.len())
            .finish()
    }
}
