//! Connection actor: one per upgraded socket.
//!
//! Each accepted socket gets a dedicated I/O thread. The thread runs the
//! handshake, spawns the [`Connection`] actor, announces it to the server
//! actor, and then becomes the connection's reader:
//!
//! ```text
//! reader thread                       Connection actor
//! -------------                       ----------------
//! read_frame() blocks
//! post(Frame) --------------------->  validate, dispatch
//! ack.recv() <---------------------   ack.try_send(())
//! read_frame() ...
//! ```
//!
//! Socket reads never happen on a worker, so a peer that stalls mid-frame
//! only holds its own thread. The reader decodes through a cloned handle;
//! the actor owns the socket for writing and closing. Dropping the ack
//! sender on close releases the reader.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, trace};

use super::close::{build_close_payload, decode_text, parse_close_payload, validate_control, WsCloseCode};
use super::error::{WsError, WsResult};
use super::fragment::{FragmentBuffer, Reassembled};
use super::frame::{read_frame, write_frame, WsFrame, WsOpcode};
use super::handshake::perform_upgrade;
use super::server::{ServerActor, ServerCommand};
use crate::actor::{Actor, Addr, Context, Runtime};
use crate::config::ServerConfig;

/// Connection identifier: the `Sec-WebSocket-Accept` value of its handshake.
pub type ConnectionId = String;

/// Per-connection limits and timeouts, derived from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    pub handshake_timeout: Duration,
    pub max_handshake_bytes: usize,
    pub idle_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_frame_bytes: u64,
    pub max_message_bytes: usize,
}

impl From<&ServerConfig> for ConnectionLimits {
    fn from(config: &ServerConfig) -> Self {
        ConnectionLimits {
            handshake_timeout: config.handshake_timeout(),
            max_handshake_bytes: config.max_handshake_bytes,
            idle_timeout: config.idle_timeout(),
            write_timeout: config.write_timeout(),
            max_frame_bytes: config.max_frame_bytes,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, upgrade request not yet answered. The actor is spawned
    /// only once the connection leaves this state.
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Commands accepted by a [`Connection`].
#[derive(Debug)]
pub enum ConnectionCommand {
    /// A frame decoded by the reader thread.
    Frame(WsFrame),
    /// Write one frame. Ignored once the connection is closing.
    Send {
        opcode: WsOpcode,
        payload: Vec<u8>,
        fin: bool,
    },
    /// Close the connection, sending a close frame with `code` if given.
    Close { code: Option<u16> },
    /// The reader hit a socket error, a malformed header or the idle
    /// timeout.
    InputFailed(WsError),
}

/// Actor owning one upgraded socket.
pub struct Connection {
    id: ConnectionId,
    token: u64,
    peer: SocketAddr,
    stream: TcpStream,
    server: Addr<ServerActor>,
    fragments: FragmentBuffer,
    state: ConnectionState,
    ack: Option<Sender<()>>,
}

impl Connection {
    fn accepted(
        stream: TcpStream,
        peer: SocketAddr,
        token: u64,
        server: Addr<ServerActor>,
        max_message_bytes: usize,
    ) -> Self {
        Connection {
            id: ConnectionId::new(),
            token,
            peer,
            stream,
            server,
            fragments: FragmentBuffer::new(max_message_bytes),
            state: ConnectionState::Handshaking,
            ack: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Answer the upgrade request and switch the socket to its open-state
    /// timeouts. On success the connection is `Open` and named by its
    /// accept key; the request path is returned.
    fn upgrade(&mut self, limits: &ConnectionLimits) -> WsResult<String> {
        if self.state != ConnectionState::Handshaking {
            return Err(WsError::Handshake("connection already upgraded".to_string()));
        }
        self.stream.set_read_timeout(Some(limits.handshake_timeout))?;
        let request = perform_upgrade(&mut self.stream, limits.max_handshake_bytes)?;

        self.stream.set_read_timeout(limits.idle_timeout)?;
        self.stream.set_write_timeout(limits.write_timeout)?;
        self.stream.set_nodelay(true)?;
        self.id = request.accept;
        self.state = ConnectionState::Open;
        Ok(request.path)
    }

    fn on_frame(&mut self, frame: WsFrame, ctx: &mut Context<Self>) {
        if self.state != ConnectionState::Open {
            return;
        }
        trace!(
            conn = %self.id,
            opcode = ?frame.opcode,
            fin = frame.fin,
            len = frame.payload.len(),
            "frame received"
        );
        match self.dispatch(frame, ctx) {
            Ok(()) => {
                if let Some(ack) = &self.ack {
                    let _ = ack.try_send(());
                }
            }
            Err(err) => self.fail(err, ctx),
        }
    }

    fn dispatch(&mut self, frame: WsFrame, ctx: &mut Context<Self>) -> WsResult<()> {
        if !frame.masked {
            return Err(WsError::UnmaskedFrame);
        }
        if frame.opcode.is_control() {
            validate_control(&frame)?;
        }

        match frame.opcode {
            WsOpcode::Close => {
                let (code, reason) = parse_close_payload(&frame.payload);
                debug!(conn = %self.id, code, reason = %reason, "close frame received");
                // Echo the peer's payload unchanged.
                self.terminate(Some(frame.payload), ctx);
            }
            WsOpcode::Ping => {
                debug!(conn = %self.id, len = frame.payload.len(), "ping received");
                self.write(WsOpcode::Pong, &frame.payload, true)?;
            }
            WsOpcode::Pong => {
                debug!(conn = %self.id, len = frame.payload.len(), "pong received");
            }
            WsOpcode::Text | WsOpcode::Binary | WsOpcode::Continuation => {
                self.assemble(frame)?;
            }
        }
        Ok(())
    }

    fn assemble(&mut self, frame: WsFrame) -> WsResult<()> {
        match self.fragments.push(frame)? {
            Reassembled::Pending => {}
            Reassembled::Complete {
                opcode: WsOpcode::Text,
                payload,
            } => {
                let text = decode_text(payload)?;
                debug!(conn = %self.id, len = text.len(), "text received");
                self.server.post(ServerCommand::Text {
                    id: self.id.clone(),
                    text,
                });
            }
            Reassembled::Complete { payload, .. } => {
                debug!(conn = %self.id, len = payload.len(), "binary received");
                self.server.post(ServerCommand::Binary {
                    id: self.id.clone(),
                    data: payload,
                });
            }
        }
        Ok(())
    }

    fn write(&mut self, opcode: WsOpcode, payload: &[u8], fin: bool) -> WsResult<()> {
        write_frame(&mut self.stream, opcode, payload, fin)?;
        trace!(conn = %self.id, ?opcode, fin, len = payload.len(), "frame sent");
        Ok(())
    }

    fn send(&mut self, opcode: WsOpcode, payload: &[u8], fin: bool, ctx: &mut Context<Self>) {
        if self.state != ConnectionState::Open {
            debug!(conn = %self.id, ?opcode, "send on closed connection dropped");
            return;
        }
        if let Err(err) = self.write(opcode, payload, fin) {
            self.fail(err, ctx);
        }
    }

    /// Close after an error, sending the matching status if the transport
    /// is still usable.
    fn fail(&mut self, err: WsError, ctx: &mut Context<Self>) {
        if err.is_io() {
            debug!(conn = %self.id, peer = %self.peer, error = %err, "connection lost");
        } else {
            info!(conn = %self.id, peer = %self.peer, error = %err, "closing connection");
        }
        let payload = err.close_code().map(|code| build_close_payload(code, ""));
        self.terminate(payload, ctx);
    }

    /// Idempotent close. Writes `close_payload` as a close frame (best
    /// effort), shuts the socket down and reports to the server.
    fn terminate(&mut self, close_payload: Option<Vec<u8>>, ctx: &mut Context<Self>) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Closing;
        if let Some(payload) = close_payload {
            if let Err(err) = self.write(WsOpcode::Close, &payload, true) {
                debug!(conn = %self.id, error = %err, "close frame not delivered");
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state = ConnectionState::Closed;
        self.ack = None;
        self.fragments.reset();
        self.server.post(ServerCommand::Closed {
            id: self.id.clone(),
            token: self.token,
        });
        ctx.exit();
    }
}

impl Actor for Connection {
    type Message = ConnectionCommand;

    fn handle(&mut self, msg: ConnectionCommand, ctx: &mut Context<Self>) {
        match msg {
            ConnectionCommand::Frame(frame) => self.on_frame(frame, ctx),
            ConnectionCommand::Send {
                opcode,
                payload,
                fin,
            } => self.send(opcode, &payload, fin, ctx),
            ConnectionCommand::Close { code } => {
                self.terminate(code.map(|c| build_close_payload(c, "")), ctx)
            }
            ConnectionCommand::InputFailed(err) => self.fail(err, ctx),
        }
    }

    fn stopped(&mut self) {
        debug!(conn = %self.id, token = self.token, "connection actor stopped");
    }
}

/// Upgrade an accepted socket and, on success, read frames from it until
/// the connection closes. Runs on the connection's I/O thread.
pub(crate) fn establish(
    stream: TcpStream,
    peer: SocketAddr,
    token: u64,
    server: Addr<ServerActor>,
    runtime: Runtime,
    limits: ConnectionLimits,
) {
    let mut conn = Connection::accepted(stream, peer, token, server.clone(), limits.max_message_bytes);
    let path = match conn.upgrade(&limits) {
        Ok(path) => path,
        Err(err) => {
            info!(peer = %peer, error = %err, "handshake failed");
            let _ = conn.stream.shutdown(Shutdown::Both);
            return;
        }
    };
    let reader = match conn.stream.try_clone() {
        Ok(reader) => reader,
        Err(err) => {
            info!(peer = %peer, error = %err, "failed to clone upgraded socket");
            let _ = conn.stream.shutdown(Shutdown::Both);
            return;
        }
    };

    let id = conn.id.clone();
    let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
    conn.ack = Some(ack_tx);
    let conn = runtime.spawn(conn);
    debug!(conn = %id, peer = %peer, path = %path, "connection upgraded");

    if !server.post(ServerCommand::Opened {
        id,
        token,
        peer,
        conn: conn.clone(),
    }) {
        conn.post(ConnectionCommand::Close {
            code: Some(WsCloseCode::GOING_AWAY),
        });
        return;
    }

    read_input(reader, conn, ack_rx, limits.max_frame_bytes);
}

/// Decode frames off the socket and hand each to the actor, waiting for
/// it to be consumed before reading the next.
fn read_input(mut stream: TcpStream, conn: Addr<Connection>, ack: Receiver<()>, max_frame_bytes: u64) {
    loop {
        match read_frame(&mut stream, max_frame_bytes) {
            Ok(frame) => {
                if !conn.post(ConnectionCommand::Frame(frame)) || ack.recv().is_err() {
                    break;
                }
            }
            Err(err) => {
                // EOF surfaces as `Truncated` and closes without a status.
                conn.post(ConnectionCommand::InputFailed(err));
                break;
            }
        }
    }
    debug!(actor = conn.id().as_u64(), "reader exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_from_config() {
        let config = ServerConfig {
            idle_timeout_secs: 0,
            max_frame_bytes: 1024,
            max_message_bytes: 4096,
            ..ServerConfig::default()
        };
        let limits = ConnectionLimits::from(&config);
        assert_eq!(limits.idle_timeout, None);
        assert_eq!(limits.write_timeout, Some(Duration::from_secs(10)));
        assert_eq!(limits.handshake_timeout, Duration::from_secs(10));
        assert_eq!(limits.max_handshake_bytes, 8192);
        assert_eq!(limits.max_frame_bytes, 1024);
        assert_eq!(limits.max_message_bytes, 4096);
    }

    fn accepted_pair(request: &'static str) -> (Connection, std::thread::JoinHandle<Vec<u8>>) {
        use std::io::{Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(request.as_bytes()).unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
            let mut reply = Vec::new();
            let _ = stream.read_to_end(&mut reply);
            reply
        });
        let (stream, peer) = listener.accept().unwrap();
        let server = Runtime::new(1).spawn(ServerActor::default());
        (Connection::accepted(stream, peer, 1, server, 1024), client)
    }

    #[test]
    fn test_upgrade_opens_connection() {
        let (mut conn, client) = accepted_pair(
            "GET /chat HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             \r\n",
        );
        assert_eq!(conn.state(), ConnectionState::Handshaking);
        assert_eq!(conn.id(), "");

        let limits = ConnectionLimits::from(&ServerConfig::default());
        let path = conn.upgrade(&limits).unwrap();
        assert_eq!(path, "/chat");
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.id(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(conn.stream.write_timeout().unwrap(), Some(Duration::from_secs(10)));

        // A second upgrade is refused.
        assert!(matches!(conn.upgrade(&limits), Err(WsError::Handshake(_))));

        conn.stream.shutdown(Shutdown::Both).unwrap();
        let reply = String::from_utf8(client.join().unwrap()).unwrap();
        assert!(reply.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{}", reply);
    }

    #[test]
    fn test_failed_upgrade_stays_handshaking() {
        let (mut conn, client) = accepted_pair("POST /chat HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let limits = ConnectionLimits::from(&ServerConfig::default());
        assert!(conn.upgrade(&limits).is_err());
        assert_eq!(conn.state(), ConnectionState::Handshaking);

        conn.stream.shutdown(Shutdown::Both).unwrap();
        let reply = String::from_utf8(client.join().unwrap()).unwrap();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", reply);
    }
}
