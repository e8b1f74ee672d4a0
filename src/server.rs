//! Request handling
//!
//! The [`Server`] owns the application scopes and turns inbound
//! [`ClientMessage`]s into scope, channel and object operations:
//!
//! - **handshake** binds a link to `app / session / view [/ element#instance]`,
//!   creating scopes on first use, and replies with the bound object's id and state
//! - **query** invokes a host method on a resolved object and replies with the result
//! - **notify** re-applies a client edit, withholding the echo from its sender.
//!   Properties attaching a child scope to its parent are not client-editable.
//!
//! Each request runs under its own [`CallContext`]. Protocol errors (unknown
//! app or target, private methods, malformed payloads) are logged and
//! dropped without a reply. Application errors raised by the host are
//! broadcast as console events to the whole session.
//!
//! Idle sessions are evicted out of band by [`Server::evict_idle`], either
//! called directly or on a background thread started by [`Server::spawn_reaper`].

use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use dashmap::DashMap;

use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::context::CallContext;
use crate::error::{Error, ProtocolViolation, Result};
use crate::host::ScriptHost;
use crate::identity::ObjectId;
use crate::link::{ClientLink, LinkId};
use crate::observe::{ChangeType, ObservationEngine};
use crate::protocol::{self, ClientMessage, Handshake, Notify, Query, ServerMessage};
use crate::scope::{Scope, ScopeKind};
use crate::value::{ObjectRef, ShapeKind, Value};

/// How often a handshake retries a session retired under it
const JOIN_ATTEMPTS: usize = 3;

/// Resolved destination of a query or notify
struct Resolved {
    object: ObjectRef,
    channel: Arc<Channel>,
    session: Arc<Scope>,
}

/// Protocol front end over a set of application scope trees
pub struct Server {
    config: ServerConfig,
    engine: Arc<ObservationEngine>,
    applications: DashMap<u32, Arc<Scope>>,
    memberships: DashMap<LinkId, Vec<Weak<Channel>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            engine: Arc::new(ObservationEngine::new()),
            applications: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ObservationEngine> {
        &self.engine
    }

    /// Register an application under `id`, replacing (and disposing) any
    /// previous one
    pub fn register_application(&self, id: u32, name: &str, host: Arc<dyn ScriptHost>) -> Arc<Scope> {
        let app = Scope::application(
            name,
            self.engine.clone(),
            host,
            self.config.max_clients_per_channel,
        );
        if let Some(previous) = self.applications.insert(id, app.clone()) {
            tracing::info!(app = id, name = %previous.name(), "replacing application");
            previous.dispose();
        }
        tracing::info!(app = id, name, "application registered");
        app
    }

    pub fn application(&self, id: u32) -> Option<Arc<Scope>> {
        self.applications.get(&id).map(|entry| entry.value().clone())
    }

    /// Active sessions of an application
    pub fn sessions(&self, app: u32) -> Vec<Arc<Scope>> {
        self.application(app)
            .map(|app| app.children())
            .unwrap_or_default()
    }

    pub fn session(&self, app: u32, name: &str) -> Option<Arc<Scope>> {
        self.application(app).and_then(|app| app.child(name))
    }

    /// Decode and handle a JSON-encoded client message
    pub fn handle_text(&self, link: &Arc<dyn ClientLink>, text: &str) -> Result<()> {
        match protocol::decode_client(text) {
            Ok(message) => self.handle(link, message),
            Err(err) => {
                tracing::debug!(link = %link.id(), error = %err, "dropping undecodable message");
                Err(Error::protocol(ProtocolViolation::MalformedArguments(err.to_string())))
            }
        }
    }

    /// Handle one client message.
    ///
    /// Protocol errors are returned to the transport for accounting but never
    /// answered on the wire.
    pub fn handle(&self, link: &Arc<dyn ClientLink>, message: ClientMessage) -> Result<()> {
        let result = match message {
            ClientMessage::Handshake(handshake) => self.handshake(link, handshake),
            ClientMessage::Query(query) => self.query(link, query),
            ClientMessage::Notify(notify) => self.notify(link, notify),
        };
        if let Err(err) = &result {
            tracing::debug!(link = %link.id(), error = %err, "request dropped");
        }
        result
    }

    fn handshake(&self, link: &Arc<dyn ClientLink>, handshake: Handshake) -> Result<()> {
        let app = self
            .application(handshake.app)
            .ok_or(Error::protocol(ProtocolViolation::UnknownApplication(handshake.app)))?;
        let element = handshake.element_scope_name()?;

        let session = self.join_session(&app, &handshake.session, link)?;
        let mut scope = session.within(ScopeKind::Page, &handshake.view)?;
        if let Some(name) = element {
            scope = scope.within(ScopeKind::Element, &name)?;
        }

        let state = {
            let _gate = scope.object().enter();
            serde_json::to_string(&Value::Object(scope.object().clone()).to_json())?
        };
        tracing::debug!(link = %link.id(), path = %scope.path(), id = %scope.id(), "handshake bound");
        link.send(&ServerMessage::HandshakeInform {
            callback: handshake.callback,
            target: scope.id(),
            state: Some(state),
        })?;
        Ok(())
    }

    /// Add `link` to the named session's channel, creating the session if
    /// needed. A session whose channel the reaper has just retired is disposed
    /// here and replaced by a fresh one.
    fn join_session(&self, app: &Arc<Scope>, name: &str, link: &Arc<dyn ClientLink>) -> Result<Arc<Scope>> {
        let mut attempts = 0;
        loop {
            let session = app.within(ScopeKind::Session, name)?;
            let channel = session
                .channel()
                .ok_or_else(|| Error::Disposed(format!("session {}", name)))?;
            match channel.add_client(link.clone()) {
                Ok(added) => {
                    if added {
                        self.memberships
                            .entry(link.id())
                            .or_default()
                            .push(Arc::downgrade(&channel));
                    }
                    return Ok(session);
                }
                Err(Error::Disposed(_)) if attempts < JOIN_ATTEMPTS => {
                    attempts += 1;
                    tracing::debug!(path = %session.path(), "session retired during handshake, recreating");
                    session.dispose();
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn query(&self, link: &Arc<dyn ClientLink>, query: Query) -> Result<()> {
        if query.is_private() {
            return Err(Error::protocol(ProtocolViolation::PrivateMethod(query.method)));
        }
        let args = self.decode_arguments(query.args.as_deref())?;
        let resolved = self.resolve(query.target)?;
        if resolved.channel.session() != query.session {
            return Err(Error::protocol(ProtocolViolation::UnknownTarget(query.target)));
        }

        let ctx = CallContext::for_caller(self.engine.clone(), Some(resolved.channel.clone()), link.clone());
        let host = resolved.session.host().clone();
        let outcome = {
            let _gate = resolved.object.enter();
            host.call(&ctx, &resolved.object, &query.method, &args)
        };
        match outcome {
            Ok(result) => {
                let result = serde_json::to_string(&result.to_json())?;
                link.send(&ServerMessage::QueryInform {
                    callback: query.callback,
                    result,
                })?;
                Ok(())
            }
            Err(err) => self.report(&ctx, &query.method, err),
        }
    }

    fn notify(&self, link: &Arc<dyn ClientLink>, notify: Notify) -> Result<()> {
        let change = ChangeType::from_event_type(notify.change).ok_or(Error::protocol(
            ProtocolViolation::InvalidChangeType(notify.change.code()),
        ))?;
        let resolved = self.resolve(notify.target)?;
        let value = match change {
            ChangeType::Delete => Value::Undefined,
            ChangeType::Put | ChangeType::Set => {
                let text = notify.value.as_deref().ok_or_else(|| {
                    Error::protocol(ProtocolViolation::MalformedArguments(format!(
                        "{} of '{}' carries no value",
                        change, notify.name
                    )))
                })?;
                let json: serde_json::Value = serde_json::from_str(text).map_err(|e| {
                    Error::protocol(ProtocolViolation::MalformedArguments(e.to_string()))
                })?;
                Value::from_json(&json, Some(self.engine.identities()))
            }
        };

        let ctx = CallContext::for_caller(self.engine.clone(), Some(resolved.channel.clone()), link.clone());
        ctx.ignore_for_caller(notify.target, &notify.name);
        let host = resolved.session.host().clone();
        let outcome = {
            let _gate = resolved.object.enter();
            if resolved.object.kind() == ShapeKind::Scope && resolved.object.holds_scope(&notify.name) {
                return Err(Error::protocol(ProtocolViolation::ScopeAttachment(notify.name.clone())));
            }
            match change {
                ChangeType::Delete => host.delete(&ctx, &resolved.object, &notify.name),
                ChangeType::Put | ChangeType::Set => {
                    host.set(&ctx, &resolved.object, &notify.name, value)
                }
            }
        };
        outcome.or_else(|err| self.report(&ctx, &notify.name, err))
    }

    fn decode_arguments(&self, args: Option<&str>) -> Result<Vec<Value>> {
        let Some(text) = args else {
            return Ok(Vec::new());
        };
        if text.len() > self.config.max_argument_bytes {
            return Err(Error::protocol(ProtocolViolation::PayloadTooLarge(text.len())));
        }
        let json: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::protocol(ProtocolViolation::MalformedArguments(e.to_string())))?;
        match json {
            serde_json::Value::Array(items) => Ok(items
                .iter()
                .map(|item| Value::from_json(item, Some(self.engine.identities())))
                .collect()),
            _ => Err(Error::protocol(ProtocolViolation::MalformedArguments(
                "arguments must be an array".into(),
            ))),
        }
    }

    fn resolve(&self, id: ObjectId) -> Result<Resolved> {
        let unknown = || Error::protocol(ProtocolViolation::UnknownTarget(id));
        let (object, channel) = self
            .engine
            .identities()
            .resolve_with_channel(id)
            .ok_or_else(unknown)?;
        let channel = channel.ok_or_else(unknown)?;
        let session = self.session_for(&channel).ok_or_else(unknown)?;
        Ok(Resolved {
            object,
            channel,
            session,
        })
    }

    /// The session scope owning `channel`
    fn session_for(&self, channel: &Arc<Channel>) -> Option<Arc<Scope>> {
        self.applications.iter().find_map(|app| {
            app.value()
                .child(channel.session())
                .filter(|session| session.channel().is_some_and(|own| Arc::ptr_eq(&own, channel)))
        })
    }

    /// Surface an application error as console output; protocol errors pass through
    fn report(&self, ctx: &CallContext, operation: &str, err: Error) -> Result<()> {
        if err.is_protocol() {
            return Err(err);
        }
        let session = ctx.channel().map(|c| c.session().to_string()).unwrap_or_default();
        tracing::warn!(%session, operation, error = %err, "application error");
        if self.config.console_errors {
            ctx.console("error", &err.to_string());
        }
        Ok(())
    }

    /// Remove a link from every channel it joined. Returns how many channels
    /// it left.
    pub fn disconnect(&self, link: LinkId) -> usize {
        let Some((_, channels)) = self.memberships.remove(&link) else {
            return 0;
        };
        let left = channels
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|channel| channel.remove_client(link))
            .count();
        tracing::debug!(%link, channels = left, "link disconnected");
        left
    }

    /// Dispose every session whose channel has had no clients for at least
    /// the configured timeout as of `now`. Returns the number evicted.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let timeout = self.config.session_timeout();
        let apps: Vec<Arc<Scope>> = self.applications.iter().map(|e| e.value().clone()).collect();

        let mut evicted = 0;
        for app in apps {
            for session in app.children() {
                let Some(channel) = session.channel() else {
                    continue;
                };
                channel.prune();
                if channel.try_retire(now, timeout) {
                    tracing::info!(path = %session.path(), "evicting idle session");
                    session.dispose();
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            self.memberships.retain(|_, channels| {
                channels.retain(|w| w.upgrade().is_some_and(|c| !c.is_disposed()));
                !channels.is_empty()
            });
        }
        let swept = self.engine.identities().sweep();
        if swept > 0 {
            tracing::debug!(swept, "identity map swept");
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every reaper interval on a
    /// background thread until the handle is stopped or dropped, or the
    /// server itself is dropped
    pub fn spawn_reaper(self: &Arc<Self>) -> Result<ReaperHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let server = Arc::downgrade(self);
        let interval = self.config.reaper_interval();
        let thread = std::thread::Builder::new()
            .name("scopesync-reaper".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(server) = server.upgrade() else {
                            break;
                        };
                        server.evict_idle(Instant::now());
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(ReaperHandle {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("applications", &self.applications.len())
            .field("links", &self.memberships.len())
            .field("objects", &self.engine.identities().len())
            .finish()
    }
}

/// Handle to the background reaper; stops it when dropped
pub struct ReaperHandle {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("reaper thread panicked");
            }
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
