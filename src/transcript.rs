//! Event transcripts.
//!
//! A transcript is a JSONL file with one serialized [`Event`] per line.
//! [`load_transcript`] also accepts raw Dialect A captures (the agent's
//! stdout saved verbatim); such lines go through the stream decoder.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::codec::FramedRead;
use tracing::debug;

use crate::events::{decode_stream_line, Event};
use crate::transport::{decode_line, InboundLine};
use crate::wire::codec::LineCodec;
use crate::wire::line_buffer::DEFAULT_MAX_LINE_BYTES;
use crate::{AppError, Result};

/// Appends events to a transcript file.
pub struct TranscriptWriter {
    path: PathBuf,
    writer: BufWriter<fs::File>,
    written: usize,
}

impl TranscriptWriter {
    /// Create or truncate `path`. Parent directories are created.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the file cannot be created.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::Io(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| AppError::Io(format!("failed to open {}: {e}", path.display())))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    /// Append one event and flush.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] on write failure.
    pub fn append(&mut self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.writer, "{line}")
            .and_then(|()| self.writer.flush())
            .map_err(|e| AppError::Io(format!("transcript write failed: {e}")))?;
        self.written += 1;
        Ok(())
    }

    /// Events written so far.
    #[must_use]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Destination path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read a transcript back into events, in file order.
///
/// Undecodable lines become [`Event::DecodeError`]; blank lines are skipped.
///
/// # Errors
///
/// Returns [`AppError::Io`] if the file cannot be opened or read.
pub async fn load_transcript(path: impl AsRef<Path>) -> Result<Vec<Event>> {
    let path = path.as_ref();
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| AppError::Io(format!("failed to open {}: {e}", path.display())))?;
    let mut framed = FramedRead::new(file, LineCodec::new(DEFAULT_MAX_LINE_BYTES));

    let mut events = Vec::new();
    while let Some(frame) = framed.next().await {
        let event = match frame? {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => replay_line(decode_line(line)),
            Err(err) => Event::DecodeError {
                raw: String::new(),
                error: err.to_string(),
            },
        };
        events.push(event);
    }
    debug!(path = %path.display(), events = events.len(), "transcript loaded");
    Ok(events)
}

fn replay_line(line: InboundLine) -> Event {
    match line {
        InboundLine::Json(value) => {
            recorded_event(&value).unwrap_or_else(|| decode_stream_line(&value))
        }
        InboundLine::Invalid { raw, error } => Event::DecodeError { raw, error },
    }
}

/// Recorded events use snake_case tags without dots; stream lines never do.
fn recorded_event(value: &Value) -> Option<Event> {
    let tag = value.get("type")?.as_str()?;
    if tag.contains('.') {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}
