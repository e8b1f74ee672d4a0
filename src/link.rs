//! Client links
//!
//! A [`ClientLink`] is the transport-facing end of one connected client: it
//! can deliver a [`ServerMessage`] and report whether it is still alive.
//! Framing and sockets live outside this crate; [`MemoryLink`] is an
//! in-process implementation that queues outgoing messages, used by the demo
//! CLI and the tests.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::DeliveryError;
use crate::protocol::ServerMessage;

/// Connection identity of a client link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl LinkId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Transport capability for one connected client.
///
/// Disconnects are reported by the transport, not observed through this
/// trait: when the connection behind a link closes, the transport calls
/// [`Server::disconnect`](crate::Server::disconnect) with the link's id so it
/// leaves every channel it joined and their idle clocks start. Links the
/// transport fails to report are caught late, when [`is_alive`](Self::is_alive)
/// turns false and a broadcast or the reaper prunes them.
pub trait ClientLink: Send + Sync {
    fn id(&self) -> LinkId;

    /// Deliver one message
    fn send(&self, message: &ServerMessage) -> Result<(), DeliveryError>;

    /// Whether the underlying connection is still open
    fn is_alive(&self) -> bool;
}

/// In-memory link that records every message delivered to it
pub struct MemoryLink {
    id: LinkId,
    outgoing: Mutex<Vec<ServerMessage>>,
    alive: AtomicBool,
    failing: AtomicBool,
}

impl MemoryLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: LinkId::next(),
            outgoing: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        })
    }

    /// Take every message delivered so far
    pub fn take(&self) -> Vec<ServerMessage> {
        std::mem::take(&mut *self.outgoing.lock())
    }

    /// Copy of every message delivered so far
    pub fn messages(&self) -> Vec<ServerMessage> {
        self.outgoing.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.outgoing.lock().len()
    }

    /// Mark the connection closed; later sends fail
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Make every send fail while keeping the link alive
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

impl ClientLink for MemoryLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn send(&self, message: &ServerMessage) -> Result<(), DeliveryError> {
        if !self.is_alive() {
            return Err(DeliveryError::Closed(self.id.0));
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(DeliveryError::Failed(format!("{} rejected message", self.id)));
        }
        self.outgoing.lock().push(message.clone());
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLink")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("queued", &self.message_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventInform, EventType};
    use crate::identity::ObjectId;

    fn console(text: &str) -> ServerMessage {
        ServerMessage::EventInform(EventInform {
            event: EventType::Console,
            target: ObjectId(0),
            name: "log".into(),
            value: Some(format!("{:?}", text)),
        })
    }

    #[test]
    fn test_memory_link_records_messages() {
        let link = MemoryLink::new();
        link.send(&console("a")).unwrap();
        link.send(&console("b")).unwrap();
        assert_eq!(link.message_count(), 2);
        assert_eq!(link.take().len(), 2);
        assert_eq!(link.message_count(), 0);
    }

    #[test]
    fn test_closed_link_rejects_sends() {
        let link = MemoryLink::new();
        link.close();
        assert!(!link.is_alive());
        assert_eq!(link.send(&console("x")), Err(DeliveryError::Closed(link.id().0)));
    }

    #[test]
    fn test_failing_link_stays_alive() {
        let link = MemoryLink::new();
        link.fail_sends(true);
        assert!(link.is_alive());
        assert!(matches!(link.send(&console("x")), Err(DeliveryError::Failed(_))));
    }

    #[test]
    fn test_link_ids_unique() {
        assert_ne!(MemoryLink::new().id(), MemoryLink::new().id());
    }
}
