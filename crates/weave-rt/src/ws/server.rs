//! WebSocket server: public [`Server`] handle and the [`ServerActor`].
//!
//! The server actor owns the connection registry and the user callbacks.
//! Everything that touches either one goes through its mailbox:
//! connection events (`Opened`, `Closed`, `Text`, `Binary`) from
//! connection actors, and outbound requests (`Send`, `SendAll`, `Close`,
//! `Shutdown`, callback installation) from the [`Server`] API. Callbacks
//! therefore run one at a time, in event order, on a worker thread.
//!
//! A dedicated accept thread (`weave-accept-{port}`) takes sockets off the
//! listener and hands each to its own I/O thread for the handshake.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::close::WsCloseCode;
use super::connection::{establish, Connection, ConnectionCommand, ConnectionId, ConnectionLimits};
use super::error::{WsError, WsResult};
use super::frame::WsOpcode;
use crate::actor::{Actor, Addr, Context, Runtime};
use crate::config::{ConfigError, ServerConfig};

/// Callback for open/close events: `(connection id) -> status`.
pub type ConnectionCallback = Box<dyn FnMut(&str) -> i32 + Send>;
/// Callback for text messages: `(connection id, text) -> status`.
pub type TextCallback = Box<dyn FnMut(&str, &str) -> i32 + Send>;
/// Callback for binary messages: `(connection id, bytes) -> status`.
pub type BinaryCallback = Box<dyn FnMut(&str, &[u8]) -> i32 + Send>;

/// Commands accepted by the [`ServerActor`].
pub enum ServerCommand {
    /// A connection finished its handshake.
    Opened {
        id: ConnectionId,
        token: u64,
        peer: SocketAddr,
        conn: Addr<Connection>,
    },
    /// A connection closed. `token` identifies which accept it came from.
    Closed { id: ConnectionId, token: u64 },
    Text { id: ConnectionId, text: String },
    Binary { id: ConnectionId, data: Vec<u8> },
    Send {
        id: ConnectionId,
        opcode: WsOpcode,
        payload: Vec<u8>,
    },
    SendAll { opcode: WsOpcode, payload: Vec<u8> },
    Close { id: ConnectionId },
    /// Close every connection and refuse new ones.
    Shutdown,
    SetOnOpen(ConnectionCallback),
    SetOnClose(ConnectionCallback),
    SetOnText(TextCallback),
    SetOnBinary(BinaryCallback),
    /// Reply with the ids of all registered connections.
    Connections(Sender<Vec<ConnectionId>>),
}

struct ConnectionEntry {
    token: u64,
    peer: SocketAddr,
    conn: Addr<Connection>,
}

/// Actor owning the connection registry and user callbacks.
pub struct ServerActor {
    connections: FxHashMap<ConnectionId, ConnectionEntry>,
    on_open: ConnectionCallback,
    on_close: ConnectionCallback,
    on_text: TextCallback,
    on_binary: BinaryCallback,
    shutting_down: bool,
}

impl Default for ServerActor {
    fn default() -> Self {
        ServerActor {
            connections: FxHashMap::default(),
            on_open: Box::new(|_| 0),
            on_close: Box::new(|_| 0),
            on_text: Box::new(|_, _| 0),
            on_binary: Box::new(|_, _| 0),
            shutting_down: false,
        }
    }
}

fn report(event: &str, id: &str, status: i32) {
    if status != 0 {
        info!(conn = %id, status, "{} callback returned nonzero status", event);
    }
}

impl ServerActor {
    fn opened(&mut self, id: ConnectionId, token: u64, peer: SocketAddr, conn: Addr<Connection>) {
        if self.shutting_down {
            conn.post(ConnectionCommand::Close {
                code: Some(WsCloseCode::GOING_AWAY),
            });
            return;
        }
        if let Some(existing) = self.connections.get(&id) {
            warn!(
                conn = %id,
                peer = %peer,
                existing_peer = %existing.peer,
                "duplicate connection id, closing newcomer"
            );
            conn.post(ConnectionCommand::Close {
                code: Some(WsCloseCode::PROTOCOL_ERROR),
            });
            return;
        }
        info!(conn = %id, peer = %peer, "connection opened");
        self.connections
            .insert(id.clone(), ConnectionEntry { token, peer, conn });
        let status = (self.on_open)(&id);
        report("open", &id, status);
    }

    fn closed(&mut self, id: ConnectionId, token: u64) {
        match self.connections.get(&id) {
            Some(entry) if entry.token == token => {}
            _ => {
                debug!(conn = %id, token, "close for unregistered connection ignored");
                return;
            }
        }
        if let Some(entry) = self.connections.remove(&id) {
            info!(conn = %id, peer = %entry.peer, "connection closed");
        }
        let status = (self.on_close)(&id);
        report("close", &id, status);
    }

    fn forward(&self, id: &str, cmd: ConnectionCommand) {
        match self.connections.get(id) {
            Some(entry) => {
                entry.conn.post(cmd);
            }
            None => debug!(conn = %id, "unknown connection id ignored"),
        }
    }
}

impl Actor for ServerActor {
    type Message = ServerCommand;

    fn handle(&mut self, msg: ServerCommand, _ctx: &mut Context<Self>) {
        match msg {
            ServerCommand::Opened {
                id,
                token,
                peer,
                conn,
            } => self.opened(id, token, peer, conn),
            ServerCommand::Closed { id, token } => self.closed(id, token),
            ServerCommand::Text { id, text } => {
                if self.connections.contains_key(&id) {
                    let status = (self.on_text)(&id, &text);
                    report("text", &id, status);
                }
            }
            ServerCommand::Binary { id, data } => {
                if self.connections.contains_key(&id) {
                    let status = (self.on_binary)(&id, &data);
                    report("binary", &id, status);
                }
            }
            ServerCommand::Send {
                id,
                opcode,
                payload,
            } => self.forward(
                &id,
                ConnectionCommand::Send {
                    opcode,
                    payload,
                    fin: true,
                },
            ),
            ServerCommand::SendAll { opcode, payload } => {
                for entry in self.connections.values() {
                    entry.conn.post(ConnectionCommand::Send {
                        opcode,
                        payload: payload.clone(),
                        fin: true,
                    });
                }
            }
            ServerCommand::Close { id } => self.forward(
                &id,
                ConnectionCommand::Close {
                    code: Some(WsCloseCode::NORMAL),
                },
            ),
            ServerCommand::Shutdown => {
                self.shutting_down = true;
                debug!(connections = self.connections.len(), "closing all connections");
                for entry in self.connections.values() {
                    entry.conn.post(ConnectionCommand::Close {
                        code: Some(WsCloseCode::GOING_AWAY),
                    });
                }
            }
            ServerCommand::SetOnOpen(f) => self.on_open = f,
            ServerCommand::SetOnClose(f) => self.on_close = f,
            ServerCommand::SetOnText(f) => self.on_text = f,
            ServerCommand::SetOnBinary(f) => self.on_binary = f,
            ServerCommand::Connections(reply) => {
                let _ = reply.send(self.connections.keys().cloned().collect());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Server handle
// ---------------------------------------------------------------------------

struct ServerInner {
    config: ServerConfig,
    local_addr: SocketAddr,
    runtime: Runtime,
    actor: Addr<ServerActor>,
    running: Arc<AtomicBool>,
    listener: Mutex<Option<TcpListener>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a WebSocket server. Clones share the same server, and
/// dropping the last one stops it.
///
/// Callbacks are stored inside the server, so a callback that needs to
/// reach the server should capture a [`WeakServer`] from
/// [`Server::downgrade`]; a captured `Server` keeps it alive until
/// [`Server::stop`].
///
/// Callbacks run on the server actor; calling [`Server::connections`] and
/// blocking on the reply from inside a callback deadlocks.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Non-owning handle to a [`Server`].
#[derive(Clone)]
pub struct WeakServer {
    inner: Weak<ServerInner>,
}

impl WeakServer {
    /// The server, unless every [`Server`] handle has been dropped.
    pub fn upgrade(&self) -> Option<Server> {
        self.inner.upgrade().map(|inner| Server { inner })
    }
}

impl std::fmt::Debug for WeakServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakServer")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Server {
    /// Bind the listening socket. The server does not accept until
    /// [`Server::start`].
    pub fn bind(config: ServerConfig) -> WsResult<Server> {
        config.validate()?;
        let addr = config.socket_addr().ok_or_else(|| {
            ConfigError::Invalid(format!("{}:{} is not a socket address", config.host, config.port))
        })?;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let runtime = Runtime::new(config.workers);
        let actor = runtime.spawn(ServerActor::default());
        debug!(addr = %local_addr, workers = runtime.workers(), "server bound");

        Ok(Server {
            inner: Arc::new(ServerInner {
                config,
                local_addr,
                runtime,
                actor,
                running: Arc::new(AtomicBool::new(false)),
                listener: Mutex::new(Some(listener)),
                accept_thread: Mutex::new(None),
            }),
        })
    }

    /// Bind on all interfaces with default settings. Port 0 picks an
    /// ephemeral port.
    pub fn bind_port(port: u16) -> WsResult<Server> {
        Server::bind(ServerConfig::with_port(port))
    }

    /// Start accepting connections. Starting a running server is a no-op;
    /// starting a stopped one fails with [`WsError::Closed`].
    pub fn start(&self) -> WsResult<()> {
        let guard = self.inner.listener.lock();
        let Some(listener) = guard.as_ref() else {
            return Err(WsError::Closed);
        };
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let spawned = listener.try_clone().and_then(|listener| {
            let accept = AcceptLoop {
                listener,
                running: Arc::clone(&self.inner.running),
                server: self.inner.actor.clone(),
                runtime: self.inner.runtime.clone(),
                limits: ConnectionLimits::from(&self.inner.config),
            };
            thread::Builder::new()
                .name(format!("weave-accept-{}", self.inner.local_addr.port()))
                .spawn(move || accept.run())
        });
        match spawned {
            Ok(handle) => {
                *self.inner.accept_thread.lock() = Some(handle);
                info!(addr = %self.inner.local_addr, "server listening");
                Ok(())
            }
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(err.into())
            }
        }
    }

    /// Stop accepting, close every connection and release the port.
    /// Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn downgrade(&self) -> WeakServer {
        WeakServer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The bound port (useful after binding port 0).
    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn send_text(&self, id: &str, text: &str) {
        self.post(ServerCommand::Send {
            id: id.to_string(),
            opcode: WsOpcode::Text,
            payload: text.as_bytes().to_vec(),
        });
    }

    pub fn send_binary(&self, id: &str, data: &[u8]) {
        self.post(ServerCommand::Send {
            id: id.to_string(),
            opcode: WsOpcode::Binary,
            payload: data.to_vec(),
        });
    }

    pub fn send_all_text(&self, text: &str) {
        self.post(ServerCommand::SendAll {
            opcode: WsOpcode::Text,
            payload: text.as_bytes().to_vec(),
        });
    }

    pub fn send_all_binary(&self, data: &[u8]) {
        self.post(ServerCommand::SendAll {
            opcode: WsOpcode::Binary,
            payload: data.to_vec(),
        });
    }

    /// Close one connection with status 1000. Unknown ids are ignored.
    pub fn close(&self, id: &str) {
        self.post(ServerCommand::Close { id: id.to_string() });
    }

    pub fn on_open<F>(&self, f: F)
    where
        F: FnMut(&str) -> i32 + Send + 'static,
    {
        self.post(ServerCommand::SetOnOpen(Box::new(f)));
    }

    pub fn on_close<F>(&self, f: F)
    where
        F: FnMut(&str) -> i32 + Send + 'static,
    {
        self.post(ServerCommand::SetOnClose(Box::new(f)));
    }

    pub fn on_text<F>(&self, f: F)
    where
        F: FnMut(&str, &str) -> i32 + Send + 'static,
    {
        self.post(ServerCommand::SetOnText(Box::new(f)));
    }

    pub fn on_binary<F>(&self, f: F)
    where
        F: FnMut(&str, &[u8]) -> i32 + Send + 'static,
    {
        self.post(ServerCommand::SetOnBinary(Box::new(f)));
    }

    /// Ask for the registered connection ids. The answer arrives once the
    /// server actor has handled everything posted before this call.
    pub fn connections(&self) -> Receiver<Vec<ConnectionId>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.post(ServerCommand::Connections(tx));
        rx
    }

    fn post(&self, cmd: ServerCommand) {
        if !self.inner.actor.post(cmd) {
            debug!("server actor gone, command dropped");
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.inner.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ServerInner {
    fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        let listener = self.listener.lock().take();
        if listener.is_none() {
            return;
        }
        drop(listener);
        self.actor.post(ServerCommand::Shutdown);

        if was_running {
            // Wake the blocking accept so the thread sees `running == false`.
            let _ = TcpStream::connect_timeout(&wake_addr(self.local_addr), Duration::from_millis(500));
        }
        if let Some(handle) = self.accept_thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        info!(addr = %self.local_addr, "server stopped");
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Loopback address that reaches a listener bound to `addr`.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}

struct AcceptLoop {
    listener: TcpListener,
    running: Arc<AtomicBool>,
    server: Addr<ServerActor>,
    runtime: Runtime,
    limits: ConnectionLimits,
}

impl AcceptLoop {
    fn run(self) {
        let mut token: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    token += 1;
                    self.spawn_connection(stream, peer, token);
                }
                Err(err) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(error = %err, "accept failed");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        debug!(addr = ?self.listener.local_addr().ok(), "accept loop exiting");
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, token: u64) {
        let server = self.server.clone();
        let runtime = self.runtime.clone();
        let limits = self.limits.clone();
        let spawned = thread::Builder::new()
            .name(format!("weave-conn-{}", token))
            .spawn(move || establish(stream, peer, token, server, runtime, limits));
        if let Err(err) = spawned {
            warn!(peer = %peer, error = %err, "failed to spawn connection thread");
        }
    }
}
