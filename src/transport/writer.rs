//! Stdin writer task.
//!
//! The only owner of the child's stdin. Requests are written in arrival
//! order, so concurrent callers never interleave bytes. Dropping every
//! sender lets the queue drain, then drops stdin and the child sees EOF.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{AppError, Result};

/// One queued write.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    pub bytes: Vec<u8>,
    pub reply: oneshot::Sender<Result<()>>,
}

/// Writer task: drains `rx` into `stdin` until the queue closes or a write fails.
pub(crate) async fn run_writer<W>(handle_id: u64, stdin: W, mut rx: mpsc::Receiver<WriteRequest>)
where
    W: AsyncWrite + Unpin + Send,
{
    let mut stdin = stdin;

    while let Some(WriteRequest { bytes, reply }) = rx.recv().await {
        let result = match stdin.write_all(&bytes).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        }
        .map_err(|e| {
            warn!(handle_id, error = %e, "writer: write to stdin failed");
            AppError::TransportClosed(format!("write failed: {e}"))
        });

        let failed = result.is_err();
        let _ = reply.send(result);
        if failed {
            break;
        }
    }

    let _ = stdin.shutdown().await;
    debug!(handle_id, "writer: stdin closed");
}
