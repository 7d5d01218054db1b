//! Stdout and stderr reader tasks.
//!
//! Both readers drive a [`FramedRead`] over [`LineCodec`], so the per-line
//! size limit is enforced before any JSON parsing. Stdout lines are decoded
//! here, off the actor, and posted as [`InboundLine`]s. Stderr lines are
//! forwarded verbatim. Each reader posts a closing message on EOF.

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::transport::actor::Inbox;
use crate::transport::InboundLine;
use crate::wire::codec::LineCodec;

/// Decode one framed stdout line.
///
/// Invalid JSON yields [`InboundLine::Invalid`] carrying the raw text so
/// that a single bad line never interrupts the stream.
#[must_use]
pub fn decode_line(line: String) -> InboundLine {
    match serde_json::from_str::<Value>(&line) {
        Ok(value) => InboundLine::Json(value),
        Err(e) => InboundLine::Invalid {
            raw: line,
            error: format!("malformed json: {e}"),
        },
    }
}

/// Stdout reader: frames, decodes and posts every line to the actor.
pub(crate) async fn run_stdout_reader<R>(
    handle_id: u64,
    stdout: R,
    max_line_bytes: usize,
    inbox: mpsc::Sender<Inbox>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, LineCodec::new(max_line_bytes));

    let error = loop {
        let line = match framed.next().await {
            None => break None,
            Some(Ok(Ok(line))) => {
                if line.trim().is_empty() {
                    continue;
                }
                decode_line(line)
            }
            Some(Ok(Err(err))) => {
                warn!(handle_id, error = %err, "stdout reader: undecodable line");
                InboundLine::Invalid {
                    raw: String::new(),
                    error: err.to_string(),
                }
            }
            Some(Err(err)) => {
                warn!(handle_id, error = %err, "stdout reader: read failed");
                break Some(err.to_string());
            }
        };
        if inbox.send(Inbox::Stdout(line)).await.is_err() {
            debug!(handle_id, "stdout reader: actor gone, stopping");
            return;
        }
    };

    debug!(handle_id, "stdout reader: stream closed");
    let _ = inbox.send(Inbox::StdoutClosed { error }).await;
}

/// Stderr reader: forwards each line to the actor for diagnostics.
pub(crate) async fn run_stderr_reader<R>(
    handle_id: u64,
    stderr: R,
    max_line_bytes: usize,
    inbox: mpsc::Sender<Inbox>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stderr, LineCodec::new(max_line_bytes));

    while let Some(item) = framed.next().await {
        match item {
            Ok(Ok(line)) => {
                debug!(handle_id, line = %line, "agent stderr");
                if inbox.send(Inbox::Stderr(line)).await.is_err() {
                    return;
                }
            }
            Ok(Err(err)) => debug!(handle_id, error = %err, "stderr reader: skipped line"),
            Err(err) => {
                warn!(handle_id, error = %err, "stderr reader: read failed");
                break;
            }
        }
    }

    let _ = inbox.send(Inbox::StderrClosed).await;
}
