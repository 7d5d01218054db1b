//! Child exit watcher.
//!
//! Owns the [`Child`] for its whole life. Waits for exit, or kills the child
//! when the actor fires the kill channel (or drops it), then reports the
//! exit to the actor.

use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::transport::actor::Inbox;
use crate::transport::ExitInfo;

/// Spawn the watcher task for `child`.
pub(crate) fn spawn_exit_watcher(
    handle_id: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    inbox: mpsc::Sender<Inbox>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                if let Err(err) = child.start_kill() {
                    warn!(handle_id, %err, "exit watcher: kill failed");
                }
                child.wait().await
            }
        };

        let exit = match status {
            Ok(status) => ExitInfo {
                code: status.code(),
                reason: status.to_string(),
            },
            Err(err) => {
                warn!(handle_id, %err, "exit watcher: wait failed");
                ExitInfo {
                    code: None,
                    reason: format!("wait failed: {err}"),
                }
            }
        };
        info!(handle_id, code = ?exit.code, reason = %exit.reason, "agent process exited");

        let _ = inbox.send(Inbox::Exited(exit)).await;
    });
}
