//! WebSocket protocol layer (RFC 6455) and server.
//!
//! - **Frame codec** (`frame`): frame parsing and writing with XOR masking
//! - **Close** (`close`): close codes, close payloads, control-frame checks
//! - **Fragments** (`fragment`): reassembly of fragmented data messages
//! - **Handshake** (`handshake`): HTTP upgrade and `Sec-WebSocket-Accept`
//! - **Connection** (`connection`): per-socket actor and its reader thread
//! - **Server** (`server`): public [`Server`] handle and registry actor

pub mod close;
pub mod connection;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod handshake;
pub mod server;

pub use close::{build_close_payload, parse_close_payload, send_close, WsCloseCode};
pub use connection::{ConnectionCommand, ConnectionId, ConnectionState};
pub use error::{WsError, WsResult};
pub use fragment::{FragmentBuffer, Reassembled};
pub use frame::{apply_mask, encode_frame, encode_masked_frame, read_frame, write_frame, WsFrame, WsOpcode};
pub use handshake::{compute_accept_key, perform_upgrade, UpgradeRequest};
pub use server::{Server, ServerCommand, WeakServer};
