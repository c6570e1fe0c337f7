//! Weave runtime library.
//!
//! An in-process actor runtime and a WebSocket server built on it.
//!
//! ## Modules
//!
//! - [`actor`]: actors, mailboxes, the fixed-size worker pool
//! - [`ws`]: RFC 6455 codec, handshake, connection and server actors
//! - [`config`]: TOML server configuration
//!
//! ```no_run
//! use weave_rt::Server;
//!
//! let server = Server::bind_port(9001)?;
//! let echo = server.downgrade();
//! server.on_text(move |id, text| {
//!     if let Some(server) = echo.upgrade() {
//!         server.send_text(id, text);
//!     }
//!     0
//! });
//! server.start()?;
//! # Ok::<(), weave_rt::WsError>(())
//! ```

pub mod actor;
pub mod config;
pub mod ws;

pub use actor::{Actor, ActorId, ActorStatus, Addr, Context, Runtime};
pub use config::{ConfigError, ServerConfig};
pub use ws::{ConnectionId, Server, WeakServer, WsError, WsResult};
