//! NUL-delimited JSON framing.
//!
//! Every message on the wire is a UTF-8 JSON object followed by exactly one
//! `\0` byte. Reads may split or coalesce messages arbitrarily, so decoding is
//! incremental: bytes are buffered until a terminator shows up.

use serde::Serialize;

pub const FRAME_TERMINATOR: u8 = 0;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Incremental decoder. Holds the unterminated tail between calls.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    max_frame_size: usize,
    /// Set once an oversized frame was reported; bytes are dropped up to its terminator.
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_frame_size,
            discarding: false,
        }
    }

    /// Append `bytes` and return every frame completed by them, in order.
    ///
    /// Empty frames (back-to-back terminators) are skipped. A frame longer than
    /// the size limit yields one `TooLarge` in its place and the decoder
    /// resynchronises on the next terminator; frames around it are unaffected.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Vec<u8>, FrameError>> {
        let mut out = Vec::new();
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|b| *b == FRAME_TERMINATOR) {
            let (body, tail) = (&rest[..pos], &rest[pos + 1..]);
            rest = tail;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let len = self.pending.len() + body.len();
            if len > self.max_frame_size {
                self.pending.clear();
                out.push(Err(FrameError::TooLarge(len)));
                continue;
            }
            self.pending.extend_from_slice(body);
            let frame = std::mem::take(&mut self.pending);
            if !frame.is_empty() {
                out.push(Ok(frame));
            }
        }
        if !self.discarding && !rest.is_empty() {
            let len = self.pending.len() + rest.len();
            if len > self.max_frame_size {
                self.pending.clear();
                self.discarding = true;
                out.push(Err(FrameError::TooLarge(len)));
            } else {
                self.pending.extend_from_slice(rest);
            }
        }
        out
    }

    /// Bytes buffered for a frame that has not been terminated yet.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.discarding = false;
    }
}

/// Serialize `message` as JSON and append the terminator.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let mut buf = serde_json::to_vec(message)?;
    buf.push(FRAME_TERMINATOR);
    Ok(buf)
}
