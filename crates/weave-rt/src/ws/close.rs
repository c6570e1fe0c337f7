//! Close codes and control-frame helpers (RFC 6455 Section 5.5, 7.4).

use std::io::Write;

use super::error::{WsError, WsResult};
use super::frame::{write_frame, WsFrame, WsOpcode, MAX_SMALL_PAYLOAD};

/// Status codes sent in close frames.
pub struct WsCloseCode;

impl WsCloseCode {
    pub const NORMAL: u16 = 1000;
    /// Server shutting down, or the peer went idle.
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Reported locally when a close frame carried no code. Never sent.
    pub const NO_STATUS: u16 = 1005;
    /// Text message was not valid UTF-8.
    pub const INVALID_DATA: u16 = 1007;
    pub const TOO_BIG: u16 = 1009;
}

/// Split a close payload into `(code, reason)`.
///
/// Payloads shorter than two bytes carry no code and report
/// [`WsCloseCode::NO_STATUS`].
pub fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    match payload {
        [hi, lo, reason @ ..] => (
            u16::from_be_bytes([*hi, *lo]),
            String::from_utf8_lossy(reason).into_owned(),
        ),
        _ => (WsCloseCode::NO_STATUS, String::new()),
    }
}

/// Build a close payload. The reason is cut so the whole payload fits a
/// control frame.
pub fn build_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let reason = reason.as_bytes();
    let keep = reason.len().min(MAX_SMALL_PAYLOAD - 2);
    let mut payload = Vec::with_capacity(2 + keep);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason[..keep]);
    payload
}

/// Decode a completed text message.
pub fn decode_text(payload: Vec<u8>) -> WsResult<String> {
    String::from_utf8(payload).map_err(|_| WsError::InvalidUtf8)
}

/// Control frames must be final and carry at most 125 bytes.
pub fn validate_control(frame: &WsFrame) -> WsResult<()> {
    if !frame.fin {
        return Err(WsError::Protocol(format!(
            "fragmented {:?} control frame",
            frame.opcode
        )));
    }
    if frame.payload.len() > MAX_SMALL_PAYLOAD {
        return Err(WsError::Protocol(format!(
            "{:?} control frame payload of {} bytes",
            frame.opcode,
            frame.payload.len()
        )));
    }
    Ok(())
}

/// Write a close frame with the given code and reason.
pub fn send_close<W: Write>(writer: &mut W, code: u16, reason: &str) -> WsResult<()> {
    write_frame(writer, WsOpcode::Close, &build_close_payload(code, reason), true)
}
