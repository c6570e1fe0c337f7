//! Reassembly of fragmented data messages (RFC 6455 Section 5.4).
//!
//! Fragments are kept in arrival order and concatenated once the final one
//! arrives. The message type is fixed by the first fragment. Later
//! fragments normally carry `Continuation`; repeating the first fragment's
//! opcode is tolerated for older clients. Control frames never reach this
//! buffer.

use super::error::{WsError, WsResult};
use super::frame::{WsFrame, WsOpcode};

/// Outcome of feeding one data frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembled {
    /// A full message is ready.
    Complete { opcode: WsOpcode, payload: Vec<u8> },
    /// More fragments are needed.
    Pending,
}

/// Per-connection buffer of not-yet-final fragments.
#[derive(Debug)]
pub struct FragmentBuffer {
    opcode: Option<WsOpcode>,
    parts: Vec<Vec<u8>>,
    size: usize,
    max_message: usize,
}

impl FragmentBuffer {
    pub fn new(max_message: usize) -> Self {
        FragmentBuffer {
            opcode: None,
            parts: Vec::new(),
            size: 0,
            max_message,
        }
    }

    /// Whether a fragmented message is in progress.
    pub fn is_assembling(&self) -> bool {
        self.opcode.is_some()
    }

    /// Bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.size
    }

    /// Drop any partial message.
    pub fn reset(&mut self) {
        self.opcode = None;
        self.parts.clear();
        self.size = 0;
    }

    /// Feed one data frame. On error the partial message is discarded.
    pub fn push(&mut self, frame: WsFrame) -> WsResult<Reassembled> {
        let result = self.accept(frame);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn accept(&mut self, frame: WsFrame) -> WsResult<Reassembled> {
        let WsFrame {
            fin,
            opcode,
            payload,
            ..
        } = frame;

        match (opcode, self.opcode) {
            (WsOpcode::Text | WsOpcode::Binary, None) => {
                self.check_size(payload.len())?;
                if fin {
                    return Ok(Reassembled::Complete { opcode, payload });
                }
                self.opcode = Some(opcode);
                self.append(payload);
                Ok(Reassembled::Pending)
            }
            (WsOpcode::Text | WsOpcode::Binary, Some(first)) if opcode != first => {
                Err(WsError::Protocol(format!(
                    "{:?} frame inside a fragmented {:?} message",
                    opcode, first
                )))
            }
            (WsOpcode::Continuation | WsOpcode::Text | WsOpcode::Binary, Some(first)) => {
                self.check_size(payload.len())?;
                self.append(payload);
                if !fin {
                    return Ok(Reassembled::Pending);
                }
                let payload = self.parts.concat();
                self.reset();
                Ok(Reassembled::Complete {
                    opcode: first,
                    payload,
                })
            }
            (WsOpcode::Continuation, None) => Err(WsError::Protocol(
                "continuation frame without a message in progress".to_string(),
            )),
            (control, _) => Err(WsError::Protocol(format!(
                "{:?} frame fed to fragment reassembly",
                control
            ))),
        }
    }

    fn check_size(&self, incoming: usize) -> WsResult<()> {
        if self.size.saturating_add(incoming) > self.max_message {
            return Err(WsError::MessageTooLarge {
                max: self.max_message,
            });
        }
        Ok(())
    }

    fn append(&mut self, payload: Vec<u8>) {
        self.size += payload.len();
        self.parts.push(payload);
    }
}
