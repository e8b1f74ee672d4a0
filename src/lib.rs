//! Scopesync: reactive scope tree and object synchronization for server-driven UIs
//!
//! Application logic runs once, on the server, inside a tree of scopes. Every
//! property mutation on an observed object in that tree is classified as a
//! Put, Set or Delete and pushed to every client of the owning session, except
//! that a client never receives the echo of its own edit. Clients keep a
//! mirror of the objects they were sent and report their local edits back.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use scopesync::host::NativeHost;
//! use scopesync::link::{ClientLink, MemoryLink};
//! use scopesync::protocol::{ClientMessage, Handshake};
//! use scopesync::{Server, ServerConfig, Value};
//!
//! fn main() -> scopesync::Result<()> {
//!     let server = Server::new(ServerConfig::default());
//!     let host = NativeHost::new().method("increment", |ctx, this, _args| {
//!         let next = ctx.get(this, "count").as_number().unwrap_or(0.0) + 1.0;
//!         ctx.set(this, "count", next)?;
//!         Ok(Value::Number(next))
//!     });
//!     server.register_application(1, "counter", host.into_host());
//!
//!     let link: Arc<dyn ClientLink> = MemoryLink::new();
//!     server.handle(&link, ClientMessage::Handshake(Handshake::view(1, "s1", "home", 1)))?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! A request flows: [`link`] → [`protocol`] → [`server`] → [`scope`] / [`host`] → [`observe`] → [`channel`] → [`link`]
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Object model** | [`value`], [`identity`], [`observe`] |
//! | **Sessions** | [`scope`], [`channel`], [`context`], [`link`] |
//! | **Protocol** | [`protocol`], [`server`], [`host`], [`config`] |
//! | **Client** | [`client`] |

pub mod channel;
pub mod client;
pub mod config;
pub mod context;
pub mod host;
pub mod identity;
pub mod link;
pub mod observe;
pub mod prelude;
pub mod protocol;
pub mod scope;
pub mod server;
pub mod value;

mod error;

pub use config::ServerConfig;
pub use error::{DeliveryError, Error, ErrorKind, ProtocolViolation, Result};
pub use server::Server;
pub use value::Value;

/// Scopesync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
