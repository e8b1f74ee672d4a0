//! Shared test helpers for integration tests
#![allow(dead_code)]

use std::sync::Arc;

use scopesync::host::NativeHost;
use scopesync::identity::ObjectId;
use scopesync::link::{ClientLink, MemoryLink};
use scopesync::protocol::{ClientMessage, EventInform, EventType, Handshake, ServerMessage};
use scopesync::scope::ScopeKind;
use scopesync::{Error, Server, ServerConfig, Value};

/// A connected test client
pub struct TestClient {
    pub memory: Arc<MemoryLink>,
    pub link: Arc<dyn ClientLink>,
}

impl TestClient {
    pub fn new() -> Self {
        let memory = MemoryLink::new();
        let link: Arc<dyn ClientLink> = memory.clone();
        Self { memory, link }
    }

    /// Handshake onto `session/view` of app 1 and return the bound object id
    pub fn join(&self, server: &Server, session: &str, view: &str) -> ObjectId {
        server
            .handle(&self.link, ClientMessage::Handshake(Handshake::view(1, session, view, 1)))
            .unwrap();
        self.memory
            .take()
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::HandshakeInform { target, .. } => Some(target),
                _ => None,
            })
            .unwrap()
    }

    /// Every event received since the last call
    pub fn events(&self) -> Vec<EventInform> {
        self.memory
            .take()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::EventInform(event) => Some(event),
                _ => None,
            })
            .collect()
    }
}

/// Counter application: pages start with `count = 0`; `increment` bumps it,
/// `fail` raises a TypeError
pub fn counter_host() -> NativeHost {
    NativeHost::new()
        .on_create(ScopeKind::Page, |ctx, scope| {
            ctx.set(scope.object(), "count", 0.0)?;
            Ok(())
        })
        .method("increment", |ctx, this, _args| {
            let next = ctx.get(this, "count").as_number().unwrap_or(0.0) + 1.0;
            ctx.set(this, "count", next)?;
            Ok(Value::Number(next))
        })
        .method("fail", |_ctx, _this, _args| Err(Error::type_error("count is frozen")))
}

/// Server with the counter application registered as app 1
pub fn counter_server(config: ServerConfig) -> Server {
    let server = Server::new(config);
    server.register_application(1, "counter", counter_host().into_host());
    server
}

/// Events of the given type only
pub fn of_type(events: &[EventInform], event: EventType) -> Vec<EventInform> {
    events.iter().filter(|e| e.event == event).cloned().collect()
}
