//! Minimal blocking WebSocket client and server fixtures for integration
//! tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crossbeam_channel::Receiver;
use weave_rt::ws::{compute_accept_key, encode_masked_frame, read_frame, WsFrame, WsOpcode};
use weave_rt::{Server, ServerConfig};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Something the server reported through a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open(String),
    Close(String),
    Text(String, String),
    Binary(String, Vec<u8>),
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        workers: 2,
        ..ServerConfig::default()
    }
}

/// Start a server whose callbacks forward every event to the returned
/// receiver. With `echo`, text and binary messages are sent back.
pub fn start_server(config: ServerConfig, echo: bool) -> (Server, Receiver<Event>) {
    let server = Server::bind(config).unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();

    let open_tx = tx.clone();
    server.on_open(move |id| {
        let _ = open_tx.send(Event::Open(id.to_string()));
        0
    });
    let close_tx = tx.clone();
    server.on_close(move |id| {
        let _ = close_tx.send(Event::Close(id.to_string()));
        0
    });
    let text_tx = tx.clone();
    let text_server = server.downgrade();
    server.on_text(move |id, text| {
        let _ = text_tx.send(Event::Text(id.to_string(), text.to_string()));
        if let Some(server) = text_server.upgrade().filter(|_| echo) {
            server.send_text(id, text);
        }
        0
    });
    let binary_server = server.downgrade();
    server.on_binary(move |id, data| {
        let _ = tx.send(Event::Binary(id.to_string(), data.to_vec()));
        if let Some(server) = binary_server.upgrade().filter(|_| echo) {
            server.send_binary(id, data);
        }
        0
    });

    server.start().unwrap();
    (server, rx)
}

pub fn next_event(events: &Receiver<Event>) -> Event {
    events.recv_timeout(TIMEOUT).expect("no event from server")
}

pub struct TestClient {
    pub stream: TcpStream,
    pub id: String,
}

impl TestClient {
    /// Connect and complete the upgrade handshake with a fresh key.
    pub fn connect(port: u16) -> TestClient {
        let key = format!("weave-test-{:016x}", rand::random::<u64>());
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        write!(
            stream,
            "GET /ws HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n",
            key
        )
        .unwrap();

        let head = read_head(&mut stream);
        assert!(
            head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
            "unexpected response: {}",
            head
        );
        let id = compute_accept_key(&key);
        assert!(head.contains(&format!("Sec-WebSocket-Accept: {}\r\n", id)));
        TestClient { stream, id }
    }

    /// Connect and wait until the server has reported the open.
    pub fn connect_registered(port: u16, events: &Receiver<Event>) -> TestClient {
        let client = TestClient::connect(port);
        assert_eq!(next_event(events), Event::Open(client.id.clone()));
        client
    }

    pub fn send(&mut self, fin: bool, opcode: WsOpcode, payload: &[u8]) {
        let frame = encode_masked_frame(fin, opcode, payload, rand::random());
        self.stream.write_all(&frame).unwrap();
    }

    pub fn send_text(&mut self, text: &str) {
        self.send(true, WsOpcode::Text, text.as_bytes());
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    pub fn recv(&mut self) -> WsFrame {
        read_frame(&mut self.stream, u64::MAX).unwrap()
    }

    /// Whether the server has closed the socket.
    pub fn at_eof(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(self.stream.read(&mut buf), Ok(0) | Err(_))
    }
}

/// Read an HTTP response head byte by byte.
pub fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}
