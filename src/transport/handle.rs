//! Public handle API over the transport actor.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Encoder;

use crate::transport::actor::{Actor, ActorParts, Inbox};
use crate::transport::spawner::spawn_process;
use crate::transport::{
    exit, reader, writer, ProcessSpec, StopMode, SubscriberId, TransportEvent, TransportOptions,
    TransportState, TransportStatus,
};
use crate::wire::codec::LineCodec;
use crate::{AppError, Result};

const INBOX_CAPACITY: usize = 1024;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Cloneable handle to one running agent process.
///
/// When the last clone is dropped the process is stopped gracefully.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: u64,
    pid: Option<u32>,
    inbox: mpsc::Sender<Inbox>,
    state: watch::Receiver<TransportState>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        post_from_drop(
            &self.inbox,
            Inbox::Stop {
                mode: StopMode::Graceful,
                reply: None,
            },
        );
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl ProcessHandle {
    /// Spawn `spec` and start its actor, reader, writer and exit watcher.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] when the process cannot be launched.
    pub fn start(spec: &ProcessSpec, options: TransportOptions) -> Result<Self> {
        let spawned = spawn_process(spec)?;
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (stdin_tx, stdin_rx) = mpsc::channel(options.stdin_queue.max(1));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(TransportState::Running);

        tokio::spawn(writer::run_writer(id, spawned.stdin, stdin_rx));
        tokio::spawn(reader::run_stdout_reader(
            id,
            spawned.stdout,
            options.max_line_bytes,
            inbox_tx.clone(),
        ));
        tokio::spawn(reader::run_stderr_reader(
            id,
            spawned.stderr,
            options.max_line_bytes,
            inbox_tx.clone(),
        ));
        exit::spawn_exit_watcher(id, spawned.child, kill_rx, inbox_tx.clone());

        let actor = Actor::new(ActorParts {
            handle_id: id,
            pid: spawned.pid,
            options,
            inbox: inbox_rx,
            state_tx,
            stdin: stdin_tx,
            kill: kill_tx,
        });
        tokio::spawn(actor.run());

        Ok(Self {
            inner: Arc::new(HandleInner {
                id,
                pid: spawned.pid,
                inbox: inbox_tx,
                state: state_rx,
            }),
        })
    }

    /// Handle identifier, unique per process launch.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// OS process id, if known.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Latest lifecycle state without a round trip to the actor.
    #[must_use]
    pub fn state(&self) -> TransportState {
        self.inner.state.borrow().clone()
    }

    /// Register a subscriber. Its stream ends with [`TransportEvent::Closed`].
    ///
    /// The first subscriber also receives output buffered while nobody was
    /// listening.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] once the handle has terminated.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.post(Inbox::Subscribe { reply }).await?;
        let (id, events) = rx.await.map_err(|_| terminated())?;
        Ok(Subscription {
            id,
            events,
            inbox: self.inner.inbox.clone(),
        })
    }

    /// Remove a subscriber by id. Dropping the [`Subscription`] does the same.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.inner.inbox.send(Inbox::Unsubscribe(id)).await;
    }

    /// Write raw bytes to the agent's stdin.
    ///
    /// Writes are serialized; the call returns once the bytes are flushed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] when stdin is closed, the write
    /// queue is full or the write fails.
    pub async fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Inbox::Write {
            bytes: bytes.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| terminated())?
    }

    /// Serialize `value` as one NDJSON line and send it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send`], plus [`AppError::Decode`] if serialization
    /// fails.
    pub async fn send_json(&self, value: &Value) -> Result<()> {
        let mut buf = BytesMut::new();
        LineCodec::default().encode(serde_json::to_string(value)?, &mut buf)?;
        self.send(buf.to_vec()).await
    }

    /// Stop the process and wait until the handle has terminated.
    ///
    /// Always returns; escalation is bounded by the configured graces.
    pub async fn stop(&self, mode: StopMode) -> TransportStatus {
        let (reply, rx) = oneshot::channel();
        if self
            .post(Inbox::Stop {
                mode,
                reply: Some(reply),
            })
            .await
            .is_err()
        {
            return self.terminated_status();
        }
        rx.await.unwrap_or_else(|_| self.terminated_status())
    }

    /// Current status from the actor.
    pub async fn status(&self) -> TransportStatus {
        let (reply, rx) = oneshot::channel();
        if self.post(Inbox::Status(reply)).await.is_err() {
            return self.terminated_status();
        }
        rx.await.unwrap_or_else(|_| self.terminated_status())
    }

    /// Take a lease that keeps the process alive while held, even with no
    /// subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] once the handle has terminated.
    pub async fn acquire(&self) -> Result<Lease> {
        self.post(Inbox::Acquire).await?;
        Ok(Lease {
            inbox: self.inner.inbox.clone(),
        })
    }

    /// Resolve once the handle reaches [`TransportState::Terminated`].
    pub async fn wait_terminated(&self) {
        let mut state = self.inner.state.clone();
        let _ = state.wait_for(|s| *s == TransportState::Terminated).await;
    }

    async fn post(&self, msg: Inbox) -> Result<()> {
        self.inner.inbox.send(msg).await.map_err(|_| terminated())
    }

    fn terminated_status(&self) -> TransportStatus {
        TransportStatus {
            handle_id: self.inner.id,
            pid: self.inner.pid,
            state: TransportState::Terminated,
            subscribers: 0,
            leases: 0,
            exit: None,
        }
    }
}

/// Stream of [`TransportEvent`]s for one subscriber.
///
/// `recv` returning `None` without a preceding `Closed` means the
/// subscriber fell behind and was dropped.
pub struct Subscription {
    id: SubscriberId,
    events: mpsc::Receiver<TransportEvent>,
    inbox: mpsc::Sender<Inbox>,
}

impl Subscription {
    /// Subscriber id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` when the stream has ended.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        post_from_drop(&self.inbox, Inbox::Unsubscribe(self.id));
    }
}

/// Keeps the process alive while held. Released on drop.
pub struct Lease {
    inbox: mpsc::Sender<Inbox>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Lease")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        post_from_drop(&self.inbox, Inbox::Release);
    }
}

fn terminated() -> AppError {
    AppError::TransportClosed("transport terminated".into())
}

/// Deliver `msg` from a synchronous `Drop`, falling back to a spawned send
/// when the inbox is momentarily full.
fn post_from_drop(inbox: &mpsc::Sender<Inbox>, msg: Inbox) {
    if let Err(TrySendError::Full(msg)) = inbox.try_send(msg) {
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inbox = inbox.clone();
            runtime.spawn(async move {
                let _ = inbox.send(msg).await;
            });
        }
    }
}
