//! WebSocket HTTP upgrade handshake (RFC 6455 Section 4.2).
//!
//! - [`perform_upgrade`]: read the request head, validate it, answer `101`
//!   or `400`
//! - [`compute_accept_key`]: SHA-1 + Base64 per Section 4.2.2
//! - [`write_upgrade_response`] / [`write_bad_request`]: response writers
//!
//! The request head is read one byte at a time so that nothing past the
//! blank line is consumed from the socket.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use sha1::{Digest, Sha1};

use super::error::{WsError, WsResult};

/// Magic GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// RFC 1123 date as used in HTTP headers.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// A validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    /// Header name/value pairs in arrival order.
    pub headers: Vec<(String, String)>,
    /// `Sec-WebSocket-Key` as sent by the client.
    pub key: String,
    /// `Sec-WebSocket-Accept` value; doubles as the connection id.
    pub accept: String,
}

impl UpgradeRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Read up to and including the blank line that ends the request head.
pub fn read_request_head<R: Read>(reader: &mut R, max_bytes: usize) -> WsResult<String> {
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= max_bytes {
            return Err(WsError::HandshakeTooLarge { max: max_bytes });
        }
        reader
            .read_exact(&mut byte)
            .map_err(|e| WsError::from_read(e, "handshake request"))?;
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Parse and validate a request head.
///
/// Only two things are required: a `GET` request line and a non-empty
/// `Sec-WebSocket-Key` header.
pub fn parse_upgrade_request(head: &str) -> WsResult<UpgradeRequest> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    if !request_line.starts_with("GET") {
        return Err(WsError::Handshake(format!(
            "not a GET request: {:?}",
            request_line
        )));
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or("/").to_string();

    let headers: Vec<(String, String)> = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    let key = match find_header(&headers, "Sec-WebSocket-Key") {
        Some(k) if !k.is_empty() => k.to_string(),
        _ => {
            return Err(WsError::Handshake(
                "missing Sec-WebSocket-Key header".to_string(),
            ))
        }
    };
    let accept = compute_accept_key(&key);

    Ok(UpgradeRequest {
        method,
        path,
        headers,
        key,
        accept,
    })
}

/// Write the `101 Switching Protocols` response.
pub fn write_upgrade_response<W: Write>(stream: &mut W, accept_key: &str) -> std::io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key
    )?;
    stream.flush()
}

/// Write a `400 Bad Request` response with a `Date` header and no body.
pub fn write_bad_request<W: Write>(stream: &mut W) -> std::io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 400 Bad Request\r\n\
         Date: {}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n",
        Utc::now().format(HTTP_DATE_FORMAT)
    )?;
    stream.flush()
}

/// Run the server side of the handshake.
///
/// On a malformed or oversized request a `400` is written (best effort)
/// before the error is returned. Transport failures return without a
/// response.
pub fn perform_upgrade<S: Read + Write>(stream: &mut S, max_bytes: usize) -> WsResult<UpgradeRequest> {
    let parsed = read_request_head(stream, max_bytes).and_then(|head| parse_upgrade_request(&head));
    match parsed {
        Ok(request) => {
            write_upgrade_response(stream, &request.accept)?;
            Ok(request)
        }
        Err(err @ (WsError::Handshake(_) | WsError::HandshakeTooLarge { .. })) => {
            let _ = write_bad_request(stream);
            Err(err)
        }
        Err(err) => Err(err),
    }
}
