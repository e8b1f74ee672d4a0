//! Session channels
//!
//! A [`Channel`] is the communication hub of one session: it holds the set of
//! connected client links and fans serialized events out to them. The link set
//! is a concurrent map; a broadcast takes a snapshot of the links and delivers
//! outside any lock, so links can join or leave while a broadcast is running.
//!
//! Delivery is best effort per link. A dead link is skipped and pruned, a
//! failed send is logged, and neither stops delivery to the remaining links.
//! The caller of the current operation is skipped only for the (object,
//! property) pairs its [`CallContext`] suppresses.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::identity::ObjectId;
use crate::link::{ClientLink, LinkId};
use crate::observe::ChangeEvent;
use crate::protocol::{EventInform, EventType, ServerMessage};
use crate::value::Value;

/// Delivery counters for a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub broadcasts: u64,
    pub delivered: u64,
    pub failed: u64,
    pub suppressed: u64,
}

/// Per-session hub tracking connected clients
pub struct Channel {
    session: String,
    clients: DashMap<LinkId, Arc<dyn ClientLink>>,
    idle_since: Mutex<Option<Instant>>,
    max_clients: usize,
    disposed: AtomicBool,
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    suppressed: AtomicU64,
}

impl Channel {
    pub fn new(session: &str) -> Arc<Self> {
        Self::with_limit(session, 0)
    }

    /// Channel accepting at most `max_clients` links (0 = unlimited)
    pub fn with_limit(session: &str, max_clients: usize) -> Arc<Self> {
        Arc::new(Self {
            session: session.to_string(),
            clients: DashMap::new(),
            idle_since: Mutex::new(Some(Instant::now())),
            max_clients,
            disposed: AtomicBool::new(false),
            broadcasts: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Add a link. Returns `false` if it was already connected.
    ///
    /// Membership changes that can end or resume the channel's idle period
    /// happen under the idle clock's lock, so the client limit holds under
    /// concurrent joins and a join never races [`try_retire`](Self::try_retire).
    pub fn add_client(&self, link: Arc<dyn ClientLink>) -> Result<bool> {
        let mut idle = self.idle_since.lock();
        if self.is_disposed() {
            return Err(Error::Disposed(format!("channel {}", self.session)));
        }
        let id = link.id();
        if self.clients.contains_key(&id) {
            return Ok(false);
        }
        if self.max_clients > 0 && self.clients.len() >= self.max_clients {
            return Err(Error::range_error(format!(
                "channel {} is full ({} clients)",
                self.session, self.max_clients
            )));
        }
        let added = self.clients.insert(id, link).is_none();
        *idle = None;
        tracing::debug!(session = %self.session, link = %id, "client joined");
        Ok(added)
    }

    /// Remove a link. Returns whether it was connected. The channel starts its
    /// idle clock when the last link leaves.
    pub fn remove_client(&self, id: LinkId) -> bool {
        let removed = self.clients.remove(&id).is_some();
        if removed {
            tracing::debug!(session = %self.session, link = %id, "client left");
            self.mark_idle_if_empty();
        }
        removed
    }

    fn mark_idle_if_empty(&self) {
        let mut idle = self.idle_since.lock();
        if self.clients.is_empty() && idle.is_none() {
            *idle = Some(Instant::now());
        }
    }

    /// Dispose the channel if it has had no clients for at least `timeout`
    /// as of `now`. Returns whether it was retired; once it is, every later
    /// [`add_client`](Self::add_client) fails.
    pub fn try_retire(&self, now: Instant, timeout: Duration) -> bool {
        let idle = self.idle_since.lock();
        let expired = self.clients.is_empty()
            && idle.is_some_and(|since| now.saturating_duration_since(since) >= timeout);
        if !expired || self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!(session = %self.session, "channel retired");
        true
    }

    /// Drop links whose connection has closed. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let dead: Vec<LinkId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| *entry.key())
            .collect();
        dead.into_iter().filter(|id| self.remove_client(*id)).count()
    }

    pub fn has_client(&self, id: LinkId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// When the channel last became client-less; `None` while clients are connected
    pub fn idle_since(&self) -> Option<Instant> {
        *self.idle_since.lock()
    }

    /// How long the channel has been client-less as of `now`
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.idle_since().map(|since| now.saturating_duration_since(since))
    }

    /// Deliver an event to every live link except a suppressed caller.
    ///
    /// `value` is serialized once. Returns the number of links reached.
    pub fn broadcast(
        &self,
        ctx: Option<&CallContext>,
        event: EventType,
        target: ObjectId,
        name: &str,
        value: Option<&Value>,
    ) -> usize {
        let encoded = match value.map(|v| serde_json::to_string(&v.to_json())).transpose() {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(session = %self.session, %target, name, error = %err, "failed to serialize event value");
                self.failed.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        };
        let message = ServerMessage::EventInform(EventInform {
            event,
            target,
            name: name.to_string(),
            value: encoded,
        });
        self.deliver(&message, |link| {
            ctx.is_some_and(|ctx| ctx.is_suppressed_for(link, target, name))
        })
    }

    /// Broadcast a classified property change
    pub fn publish_change(&self, ctx: &CallContext, change: &ChangeEvent) -> usize {
        self.broadcast(
            Some(ctx),
            change.change.event_type(),
            change.target,
            &change.name,
            change.value.as_ref(),
        )
    }

    /// Broadcast a custom event
    pub fn emit(&self, ctx: &CallContext, target: ObjectId, name: &str, value: &Value) -> usize {
        self.broadcast(Some(ctx), EventType::Custom, target, name, Some(value))
    }

    /// Broadcast console output to every client, the caller included
    pub fn console(&self, level: &str, message: &str) -> usize {
        self.broadcast(
            None,
            EventType::Console,
            ObjectId(0),
            level,
            Some(&Value::String(message.to_string())),
        )
    }

    fn deliver(&self, message: &ServerMessage, skip: impl Fn(LinkId) -> bool) -> usize {
        if self.is_disposed() {
            return 0;
        }
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        let links: Vec<Arc<dyn ClientLink>> =
            self.clients.iter().map(|entry| entry.value().clone()).collect();

        let mut reached = 0;
        for link in links {
            let id = link.id();
            if !link.is_alive() {
                self.remove_client(id);
                continue;
            }
            if skip(id) {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match link.send(message) {
                Ok(()) => {
                    reached += 1;
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(session = %self.session, link = %id, error = %err, "delivery failed");
                }
            }
        }
        reached
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }

    /// Drop every link and refuse further ones
    pub fn dispose(&self) {
        let _idle = self.idle_since.lock();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.clients.clear();
        tracing::debug!(session = %self.session, "channel disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("session", &self.session)
            .field("clients", &self.clients.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;
    use crate::observe::ObservationEngine;

    fn ctx_for(channel: &Arc<Channel>, caller: &Arc<MemoryLink>) -> CallContext {
        CallContext::for_caller(
            Arc::new(ObservationEngine::new()),
            Some(channel.clone()),
            caller.clone(),
        )
    }

    #[test]
    fn test_add_is_idempotent() {
        let channel = Channel::new("s1");
        let link = MemoryLink::new();
        assert!(channel.add_client(link.clone()).unwrap());
        assert!(!channel.add_client(link.clone()).unwrap());
        assert_eq!(channel.client_count(), 1);
        assert!(channel.idle_since().is_none());
    }

    #[test]
    fn test_last_removal_starts_idle_clock() {
        let channel = Channel::new("s1");
        let a = MemoryLink::new();
        let b = MemoryLink::new();
        channel.add_client(a.clone()).unwrap();
        channel.add_client(b.clone()).unwrap();

        assert!(channel.remove_client(a.id()));
        assert!(channel.idle_since().is_none());
        assert!(channel.remove_client(b.id()));
        assert!(channel.idle_since().is_some());
        assert!(!channel.remove_client(b.id()));
    }

    #[test]
    fn test_broadcast_suppresses_only_flagged_caller_pair() {
        let channel = Channel::new("s1");
        let a = MemoryLink::new();
        let b = MemoryLink::new();
        channel.add_client(a.clone()).unwrap();
        channel.add_client(b.clone()).unwrap();

        let ctx = ctx_for(&channel, &a);
        ctx.ignore_for_caller(ObjectId(5), "x");

        let value = Value::Number(10.0);
        assert_eq!(channel.broadcast(Some(&ctx), EventType::PropertySet, ObjectId(5), "x", Some(&value)), 1);
        assert_eq!(a.message_count(), 0);
        assert_eq!(b.message_count(), 1);

        assert_eq!(channel.broadcast(Some(&ctx), EventType::PropertySet, ObjectId(5), "y", Some(&value)), 2);
        assert_eq!(a.message_count(), 1);
        assert_eq!(channel.stats().suppressed, 1);
    }

    #[test]
    fn test_failed_delivery_does_not_stop_others() {
        let channel = Channel::new("s1");
        let bad = MemoryLink::new();
        let good = MemoryLink::new();
        bad.fail_sends(true);
        channel.add_client(bad.clone()).unwrap();
        channel.add_client(good.clone()).unwrap();

        assert_eq!(channel.console("error", "boom"), 1);
        assert_eq!(good.message_count(), 1);
        assert_eq!(channel.stats().failed, 1);
        assert!(channel.has_client(bad.id()));
    }

    #[test]
    fn test_dead_links_are_pruned() {
        let channel = Channel::new("s1");
        let dead = MemoryLink::new();
        channel.add_client(dead.clone()).unwrap();
        dead.close();

        assert_eq!(channel.console("log", "hi"), 0);
        assert_eq!(channel.client_count(), 0);
        assert!(channel.idle_since().is_some());
    }

    #[test]
    fn test_console_reaches_caller_despite_suppression() {
        let channel = Channel::new("s1");
        let a = MemoryLink::new();
        channel.add_client(a.clone()).unwrap();
        let ctx = ctx_for(&channel, &a);
        ctx.ignore_for_caller(ObjectId(0), "error");
        assert_eq!(channel.console("error", "TypeError: x"), 1);
        let event = a.take().remove(0);
        let event = event.as_event().unwrap();
        assert_eq!(event.event, EventType::Console);
        assert_eq!(event.value.as_deref(), Some("\"TypeError: x\""));
    }

    #[test]
    fn test_prune_removes_closed_links() {
        let channel = Channel::new("s1");
        let open = MemoryLink::new();
        let closed = MemoryLink::new();
        channel.add_client(open.clone()).unwrap();
        channel.add_client(closed.clone()).unwrap();
        closed.close();

        assert_eq!(channel.prune(), 1);
        assert!(channel.has_client(open.id()));
        assert!(!channel.has_client(closed.id()));
        assert!(channel.idle_since().is_none());
    }

    #[test]
    fn test_client_limit_enforced() {
        let channel = Channel::with_limit("s1", 1);
        channel.add_client(MemoryLink::new()).unwrap();
        assert!(channel.add_client(MemoryLink::new()).is_err());
    }

    #[test]
    fn test_client_limit_holds_under_concurrent_joins() {
        let channel = Channel::with_limit("s1", 3);
        let joined = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let channel = channel.clone();
                    s.spawn(move || channel.add_client(MemoryLink::new()).is_ok())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count()
        });
        assert_eq!(joined, 3);
        assert_eq!(channel.client_count(), 3);
    }

    #[test]
    fn test_retire_only_when_empty_and_expired() {
        let channel = Channel::new("s1");
        let link = MemoryLink::new();
        let timeout = Duration::from_secs(1);
        let later = Instant::now() + Duration::from_secs(5);

        channel.add_client(link.clone()).unwrap();
        assert!(!channel.try_retire(later, timeout));
        channel.remove_client(link.id());
        assert!(!channel.try_retire(Instant::now(), timeout));
        assert!(channel.try_retire(later, timeout));
        assert!(!channel.try_retire(later, timeout));

        assert!(channel.is_disposed());
        assert!(matches!(channel.add_client(link.clone()), Err(Error::Disposed(_))));
        assert_eq!(channel.client_count(), 0);
    }

    #[test]
    fn test_disposed_channel_refuses_links_and_sends_nothing() {
        let channel = Channel::new("s1");
        let a = MemoryLink::new();
        channel.add_client(a.clone()).unwrap();
        channel.dispose();
        assert_eq!(channel.client_count(), 0);
        assert_eq!(channel.console("log", "x"), 0);
        assert!(matches!(channel.add_client(a.clone()), Err(Error::Disposed(_))));
    }

    #[test]
    fn test_concurrent_join_during_broadcast() {
        let channel = Channel::new("s1");
        let links: Vec<_> = (0..8).map(|_| MemoryLink::new()).collect();
        std::thread::scope(|s| {
            for link in &links {
                let channel = channel.clone();
                let link = link.clone();
                s.spawn(move || channel.add_client(link).unwrap());
            }
            for _ in 0..8 {
                let channel = channel.clone();
                s.spawn(move || channel.console("log", "tick"));
            }
        });
        assert_eq!(channel.client_count(), 8);
    }
}
