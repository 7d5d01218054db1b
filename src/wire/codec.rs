//! NDJSON codec for agent stdio streams.
//!
//! Adapts [`LineBuffer`] to [`tokio_util::codec`] so the stdout reader can
//! drive it with [`tokio_util::codec::FramedRead`], and frames outbound
//! messages for the stdin writer.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_conduit::wire::codec::LineCodec;
//!
//! let lines = FramedRead::new(child_stdout, LineCodec::new(1 << 20));
//! ```

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::wire::line_buffer::{LineBuffer, DEFAULT_MAX_LINE_BYTES};
use crate::{AppError, Result};

/// Line codec whose items carry their own decode result.
///
/// `FramedRead` stops yielding after the first `Err` from a decoder, so
/// per-line failures (oversized, invalid UTF-8) travel inside the item and
/// only I/O failures use the decoder error channel.
#[derive(Debug)]
pub struct LineCodec {
    buffer: LineBuffer,
    ready: VecDeque<Result<String>>,
}

impl LineCodec {
    /// Create a codec enforcing `max_line_bytes` per inbound line.
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: LineBuffer::new(max_line_bytes),
            ready: VecDeque::new(),
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl Decoder for LineCodec {
    type Item = Result<String>;
    type Error = AppError;

    /// Return the next complete line, consuming everything buffered in `src`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(item) = self.ready.pop_front() {
            return Ok(Some(item));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let chunk = src.split();
        self.ready.extend(self.buffer.feed(&chunk));
        Ok(self.ready.pop_front())
    }

    /// Drain queued lines, then flush an unterminated final line.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        Ok(self.buffer.finish())
    }
}

impl Encoder<String> for LineCodec {
    type Error = AppError;

    /// Encode `item` as a `\n`-terminated line.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if `item` already contains a newline,
    /// which would split one message into two on the wire.
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        if item.contains('\n') {
            return Err(AppError::Protocol(
                "outbound message contains an embedded newline".into(),
            ));
        }
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
