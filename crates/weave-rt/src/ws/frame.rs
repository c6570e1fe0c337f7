//! WebSocket frame codec (RFC 6455 Section 5.2-5.3).
//!
//! - [`read_frame`]: parse one frame from a byte stream, unmasking it
//! - [`encode_frame`] / [`write_frame`]: build an unmasked server frame
//! - [`encode_masked_frame`]: build a masked client frame (tests, tooling)
//! - [`apply_mask`]: symmetric XOR masking per Section 5.3
//!
//! Whether a frame *had* to be masked is not decided here; the connection
//! layer rejects unmasked client frames after decoding.

use std::io::{Read, Write};

use super::error::{WsError, WsResult};

/// Largest payload that fits the single-byte length field.
pub const MAX_SMALL_PAYLOAD: usize = 125;

/// WebSocket frame opcodes per RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsOpcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl WsOpcode {
    /// Parse a 4-bit opcode. Reserved values are a protocol error.
    pub fn from_u8(byte: u8) -> WsResult<WsOpcode> {
        match byte {
            0x0 => Ok(WsOpcode::Continuation),
            0x1 => Ok(WsOpcode::Text),
            0x2 => Ok(WsOpcode::Binary),
            0x8 => Ok(WsOpcode::Close),
            0x9 => Ok(WsOpcode::Ping),
            0xA => Ok(WsOpcode::Pong),
            _ => Err(WsError::Protocol(format!("unknown opcode: 0x{:X}", byte))),
        }
    }

    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }
}

/// A decoded frame. `payload` is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: WsOpcode,
    /// Whether the MASK bit was set on the wire.
    pub masked: bool,
    pub payload: Vec<u8>,
}

/// Apply or remove the 4-byte XOR mask. Applying twice is the identity.
pub fn apply_mask(payload: &mut [u8], mask_key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

fn read_bytes<R: Read>(reader: &mut R, buf: &mut [u8], what: &'static str) -> WsResult<()> {
    reader
        .read_exact(buf)
        .map_err(|e| WsError::from_read(e, what))
}

/// Parse one frame from the stream.
///
/// Payloads longer than `max_payload` are rejected before any payload byte
/// is allocated or read.
pub fn read_frame<R: Read>(reader: &mut R, max_payload: u64) -> WsResult<WsFrame> {
    // Byte 0: FIN(1) RSV(3) Opcode(4)
    // Byte 1: MASK(1) Payload-Length(7)
    let mut header = [0u8; 2];
    read_bytes(reader, &mut header, "frame header")?;

    let fin = header[0] & 0x80 != 0;
    if header[0] & 0x70 != 0 {
        return Err(WsError::Protocol(
            "non-zero RSV bits without negotiated extensions".to_string(),
        ));
    }
    let opcode = WsOpcode::from_u8(header[0] & 0x0F)?;

    let masked = header[1] & 0x80 != 0;
    let payload_len = match header[1] & 0x7F {
        126 => {
            let mut buf = [0u8; 2];
            read_bytes(reader, &mut buf, "16-bit length")?;
            u16::from_be_bytes(buf) as u64
        }
        127 => {
            let mut buf = [0u8; 8];
            read_bytes(reader, &mut buf, "64-bit length")?;
            let len = u64::from_be_bytes(buf);
            if len >> 63 != 0 {
                return Err(WsError::Protocol(
                    "MSB of 64-bit length must be 0".to_string(),
                ));
            }
            len
        }
        short => short as u64,
    };

    if payload_len > max_payload {
        return Err(WsError::FrameTooLarge {
            max: max_payload,
            actual: payload_len,
        });
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        read_bytes(reader, &mut key, "mask key")?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        read_bytes(reader, &mut payload, "payload")?;
    }
    if let Some(key) = mask_key {
        apply_mask(&mut payload, &key);
    }

    Ok(WsFrame {
        fin,
        opcode,
        masked,
        payload,
    })
}

fn push_header(out: &mut Vec<u8>, fin: bool, opcode: WsOpcode, mask_bit: u8, len: usize) {
    out.push(if fin { 0x80 } else { 0x00 } | opcode as u8);
    if len <= MAX_SMALL_PAYLOAD {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Encode an unmasked (server-to-client) frame.
pub fn encode_frame(fin: bool, opcode: WsOpcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    push_header(&mut out, fin, opcode, 0x00, payload.len());
    out.extend_from_slice(payload);
    out
}

/// Encode a masked (client-to-server) frame with the given key.
pub fn encode_masked_frame(fin: bool, opcode: WsOpcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    push_header(&mut out, fin, opcode, 0x80, payload.len());
    out.extend_from_slice(&key);
    let start = out.len();
    out.extend_from_slice(payload);
    apply_mask(&mut out[start..], &key);
    out
}

/// Write one server frame in a single `write_all`, then flush.
pub fn write_frame<W: Write>(
    writer: &mut W,
    opcode: WsOpcode,
    payload: &[u8],
    fin: bool,
) -> WsResult<()> {
    writer.write_all(&encode_frame(fin, opcode, payload))?;
    writer.flush()?;
    Ok(())
}
