//! Restart-on-demand wrapper around [`ProcessHandle`].

use tokio::sync::Mutex;
use tracing::info;

use crate::transport::{
    ProcessHandle, ProcessSpec, StopMode, TransportOptions, TransportState, TransportStatus,
};
use crate::Result;

/// Owns a [`ProcessSpec`] and the currently live handle, if any.
///
/// [`Transport::handle`] returns the live handle, or starts a fresh process
/// when the previous one terminated (idle auto-stop, crash, explicit stop).
#[derive(Debug)]
pub struct Transport {
    spec: ProcessSpec,
    options: TransportOptions,
    current: Mutex<Option<ProcessHandle>>,
}

impl Transport {
    /// Create a transport; nothing is spawned until the first `handle` call.
    #[must_use]
    pub fn new(spec: ProcessSpec, options: TransportOptions) -> Self {
        Self {
            spec,
            options,
            current: Mutex::new(None),
        }
    }

    /// Live handle, starting a new process if needed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Spawn`] when a new process cannot be started.
    pub async fn handle(&self) -> Result<ProcessHandle> {
        let mut current = self.current.lock().await;
        if let Some(handle) = current.as_ref() {
            if handle.state() != TransportState::Terminated {
                return Ok(handle.clone());
            }
            info!(
                previous = handle.id(),
                "agent process terminated; starting a new one"
            );
        }

        let handle = ProcessHandle::start(&self.spec, self.options.clone())?;
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Current handle without starting one.
    pub async fn current(&self) -> Option<ProcessHandle> {
        self.current.lock().await.clone()
    }

    /// Stop and forget the current handle. Returns its final status.
    pub async fn stop(&self, mode: StopMode) -> Option<TransportStatus> {
        let handle = self.current.lock().await.take()?;
        Some(handle.stop(mode).await)
    }
}
