//! Incremental newline framing over arbitrary byte chunks.
//!
//! The agent's stdout arrives in chunks whose boundaries bear no relation to
//! message boundaries. [`LineBuffer`] accumulates bytes and yields each
//! complete `\n`-terminated line exactly once, in order. A line that grows
//! past the configured maximum without a newline is reported as a
//! [`AppError::Decode`] item and discarded up to its terminating newline, so
//! a misbehaving process cannot make the client allocate without bound.

use crate::{AppError, Result};

/// Default maximum line length: 1 MiB.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1_048_576;

/// Stateful line accumulator.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    /// Set while skipping the tail of an oversized line.
    discarding: bool,
}

impl LineBuffer {
    /// Create a buffer enforcing `max_line_bytes` per line.
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Append `chunk` and return every line it completed, in wire order.
    ///
    /// Each item is either a complete line (terminator and any trailing `\r`
    /// stripped) or a decode error for an oversized or non-UTF-8 line.
    /// Bytes after the last newline stay buffered for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<String>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }

            self.buf.extend_from_slice(head);
            if self.buf.len() > self.max_line_bytes {
                self.buf.clear();
                out.push(Err(self.too_long()));
                continue;
            }

            let line = std::mem::take(&mut self.buf);
            out.push(into_line(line));
        }

        if self.discarding {
            return out;
        }

        self.buf.extend_from_slice(rest);
        if self.buf.len() > self.max_line_bytes {
            self.buf.clear();
            self.discarding = true;
            out.push(Err(self.too_long()));
        }

        out
    }

    /// Flush an unterminated final line at end of stream.
    ///
    /// Returns `None` when nothing is buffered or the pending bytes belong to
    /// an oversized line that was already reported.
    pub fn finish(&mut self) -> Option<Result<String>> {
        if self.discarding {
            self.discarding = false;
            self.buf.clear();
            return None;
        }
        if self.buf.is_empty() {
            return None;
        }
        Some(into_line(std::mem::take(&mut self.buf)))
    }

    /// Number of bytes held for an incomplete line.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    fn too_long(&self) -> AppError {
        AppError::Decode(format!(
            "line too long: exceeded {} bytes",
            self.max_line_bytes
        ))
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

/// Stateless form of [`LineBuffer::feed`].
///
/// Appends `chunk` to `buffer`, returning the complete lines and the
/// unterminated remainder.
///
/// # Errors
///
/// Returns [`AppError::Decode`] when a line (complete or pending) exceeds
/// `max_line_bytes` or is not valid UTF-8.
pub fn feed(buffer: &[u8], chunk: &[u8], max_line_bytes: usize) -> Result<(Vec<String>, Vec<u8>)> {
    let mut lb = LineBuffer::new(max_line_bytes);
    let mut lines = Vec::new();
    for item in lb.feed(buffer).into_iter().chain(lb.feed(chunk)) {
        lines.push(item?);
    }
    if lb.discarding {
        return Err(lb.too_long());
    }
    Ok((lines, lb.buf))
}

fn into_line(mut bytes: Vec<u8>) -> Result<String> {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    String::from_utf8(bytes).map_err(|e| AppError::Decode(format!("invalid utf-8 in line: {e}")))
}
