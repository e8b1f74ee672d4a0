//! Prelude module for convenient imports
//!
//! ```no_run
//! use scopesync::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let server = Server::new(ServerConfig::default());
//!     server.register_application(1, "demo", NativeHost::new().into_host());
//!     Ok(())
//! }
//! ```

// Server side
pub use crate::server::{ReaperHandle, Server};
pub use crate::config::ServerConfig;
pub use crate::scope::{Scope, ScopeKind, ScopeState};
pub use crate::host::{EmptyHost, NativeHost, ScriptHost};
pub use crate::context::CallContext;

// Object model
pub use crate::value::{ObjectRef, ObservedObject, Shape, Value};
pub use crate::identity::{IdentityMap, ObjectId};
pub use crate::observe::{ChangeEvent, ChangeType, ObservationEngine};

// Transport and wire
pub use crate::channel::Channel;
pub use crate::link::{ClientLink, LinkId, MemoryLink};
pub use crate::protocol::{ClientMessage, EventInform, EventType, Handshake, Notify, Query, ServerMessage};

// Client mirror
pub use crate::client::{MirrorCache, MirrorEntry};

// Error handling
pub use crate::error::{Error, ErrorKind, ProtocolViolation, Result};

// Version constant
pub use crate::VERSION;
