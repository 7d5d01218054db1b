//! Per-handle transport actor.
//!
//! Sole owner of the handle's mutable state. Every other task (readers,
//! writer, exit watcher, API callers) talks to it through [`Inbox`].
//!
//! # Shutdown escalation
//!
//! ```text
//! Running ──stop(Graceful)──▶ close stdin ──close_grace──▶ SIGTERM
//!    │                                                      │ term_grace
//!    └──stop(Immediate)────────────────────────────────▶ kill
//!                                                           │ kill_grace
//!                                                           ▼
//!                                                    force-remove handle
//! ```
//!
//! Whenever the exit watcher reports an exit the actor switches to
//! `Draining` and waits (bounded by `drain_timeout`) for both output
//! streams to reach EOF before broadcasting `Closed`.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::transport::writer::WriteRequest;
use crate::transport::{
    ExitInfo, InboundLine, StopMode, SubscriberId, TransportEvent, TransportOptions,
    TransportState, TransportStatus,
};
use crate::{AppError, Result};

/// Messages accepted by the actor.
pub(crate) enum Inbox {
    Subscribe {
        reply: oneshot::Sender<(SubscriberId, mpsc::Receiver<TransportEvent>)>,
    },
    Unsubscribe(SubscriberId),
    Write {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        mode: StopMode,
        reply: Option<oneshot::Sender<TransportStatus>>,
    },
    Status(oneshot::Sender<TransportStatus>),
    Acquire,
    Release,
    Stdout(InboundLine),
    StdoutClosed {
        error: Option<String>,
    },
    Stderr(String),
    StderrClosed,
    Exited(ExitInfo),
}

/// Wiring handed to a new actor.
pub(crate) struct ActorParts {
    pub handle_id: u64,
    pub pid: Option<u32>,
    pub options: TransportOptions,
    pub inbox: mpsc::Receiver<Inbox>,
    pub state_tx: watch::Sender<TransportState>,
    pub stdin: mpsc::Sender<WriteRequest>,
    pub kill: oneshot::Sender<()>,
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<TransportEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopPhase {
    ClosingStdin,
    Terminating,
    Killing,
}

struct StopProgress {
    phase: StopPhase,
    deadline: Instant,
}

pub(crate) struct Actor {
    handle_id: u64,
    pid: Option<u32>,
    options: TransportOptions,
    inbox: mpsc::Receiver<Inbox>,
    state: TransportState,
    state_tx: watch::Sender<TransportState>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    batch: Vec<InboundLine>,
    backlog: VecDeque<InboundLine>,
    backlog_dropped: usize,
    stdin: Option<mpsc::Sender<WriteRequest>>,
    kill: Option<oneshot::Sender<()>>,
    leases: usize,
    idle_deadline: Option<Instant>,
    stop: Option<StopProgress>,
    stop_waiters: Vec<oneshot::Sender<TransportStatus>>,
    close_reason: Option<String>,
    exit: Option<ExitInfo>,
    stdout_open: bool,
    stderr_open: bool,
    drain_deadline: Option<Instant>,
    finished: bool,
}

impl Actor {
    pub(crate) fn new(parts: ActorParts) -> Self {
        Self {
            handle_id: parts.handle_id,
            pid: parts.pid,
            options: parts.options,
            inbox: parts.inbox,
            state: TransportState::Running,
            state_tx: parts.state_tx,
            subscribers: Vec::new(),
            next_subscriber: 1,
            batch: Vec::new(),
            backlog: VecDeque::new(),
            backlog_dropped: 0,
            stdin: Some(parts.stdin),
            kill: Some(parts.kill),
            leases: 0,
            idle_deadline: None,
            stop: None,
            stop_waiters: Vec::new(),
            close_reason: None,
            exit: None,
            stdout_open: true,
            stderr_open: true,
            drain_deadline: None,
            finished: false,
        }
    }

    pub(crate) async fn run(mut self) {
        self.refresh_idle();

        while !self.finished {
            let deadline = self.next_deadline();
            tokio::select! {
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        self.finalize("transport inbox closed".into());
                        break;
                    };
                    self.handle(msg);

                    // Coalesce whatever is already queued into the same batch.
                    let mut budget = self.options.batch_max_lines;
                    while budget > 0 && !self.finished {
                        match self.inbox.try_recv() {
                            Ok(msg) => self.handle(msg),
                            Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                        }
                        budget -= 1;
                    }
                    self.flush_batch();
                    self.refresh_idle();
                }
                () = sleep_until_opt(deadline) => {
                    self.on_deadline();
                    self.refresh_idle();
                }
            }
        }

        debug!(handle_id = self.handle_id, "transport actor stopped");
    }

    fn handle(&mut self, msg: Inbox) {
        if let Inbox::Stdout(line) = msg {
            self.batch.push(line);
            if self.batch.len() >= self.options.batch_max_lines {
                self.flush_batch();
            }
            return;
        }

        // Everything else is ordered after the lines received so far.
        self.flush_batch();

        match msg {
            Inbox::Stdout(_) => {}
            Inbox::Subscribe { reply } => {
                let (id, rx) = self.add_subscriber();
                if reply.send((id, rx)).is_err() {
                    self.subscribers.retain(|s| s.id != id);
                }
            }
            Inbox::Unsubscribe(id) => {
                self.subscribers.retain(|s| s.id != id);
                debug!(handle_id = self.handle_id, subscriber = id.0, "subscriber removed");
            }
            Inbox::Write { bytes, reply } => self.write(bytes, reply),
            Inbox::Stop { mode, reply } => {
                if let Some(reply) = reply {
                    self.stop_waiters.push(reply);
                }
                self.begin_stop(mode, "stop requested");
            }
            Inbox::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Inbox::Acquire => self.leases += 1,
            Inbox::Release => self.leases = self.leases.saturating_sub(1),
            Inbox::StdoutClosed { error } => {
                self.stdout_open = false;
                if let Some(e) = error {
                    warn!(handle_id = self.handle_id, error = %e, "agent stdout failed");
                }
                if self.exit.is_none() && self.stop.is_none() {
                    // Output is gone; give the process close_grace to exit
                    // on its own before escalating.
                    debug!(handle_id = self.handle_id, "stdout closed before exit");
                    self.set_state(TransportState::Stopping);
                    self.stdin = None;
                    self.stop = Some(StopProgress {
                        phase: StopPhase::ClosingStdin,
                        deadline: Instant::now() + self.options.close_grace,
                    });
                }
                self.maybe_finish_drain();
            }
            Inbox::Stderr(line) => self.broadcast(&TransportEvent::Stderr(line)),
            Inbox::StderrClosed => {
                self.stderr_open = false;
                self.maybe_finish_drain();
            }
            Inbox::Exited(exit) => {
                self.exit = Some(exit);
                self.stop = None;
                self.stdin = None;
                self.kill = None;
                self.drain_deadline = Some(Instant::now() + self.options.drain_timeout);
                self.set_state(TransportState::Draining);
                self.maybe_finish_drain();
            }
        }
    }

    // ── Subscribers ──────────────────────────────────────────────────────────

    fn add_subscriber(&mut self) -> (SubscriberId, mpsc::Receiver<TransportEvent>) {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        let (tx, rx) = mpsc::channel(self.options.subscriber_capacity.max(1));

        if self.subscribers.is_empty() && !self.backlog.is_empty() {
            let mut replay = Vec::with_capacity(self.backlog.len() + 1);
            if self.backlog_dropped > 0 {
                replay.push(InboundLine::Invalid {
                    raw: String::new(),
                    error: format!(
                        "backlog overflow: {} earlier lines dropped",
                        self.backlog_dropped
                    ),
                });
            }
            replay.extend(self.backlog.drain(..));
            self.backlog_dropped = 0;
            let _ = tx.try_send(TransportEvent::Lines(replay.into()));
        }

        debug!(handle_id = self.handle_id, subscriber = id.0, "subscriber added");
        self.subscribers.push(Subscriber { id, tx });
        (id, rx)
    }

    fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut self.batch);

        if self.subscribers.is_empty() {
            self.backlog.extend(lines);
            while self.backlog.len() > self.options.max_backlog_lines {
                self.backlog.pop_front();
                self.backlog_dropped += 1;
            }
            return;
        }

        let batch: Arc<[InboundLine]> = lines.into();
        self.broadcast(&TransportEvent::Lines(batch));
    }

    /// Deliver `event` to every subscriber in registration order.
    ///
    /// A subscriber whose channel is full is removed; its receiver then
    /// observes the end of the stream.
    fn broadcast(&mut self, event: &TransportEvent) {
        let handle_id = self.handle_id;
        self.subscribers
            .retain(|sub| match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(handle_id, subscriber = sub.id.0, "subscriber lagging; dropped");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }

    // ── Stdin ────────────────────────────────────────────────────────────────

    fn write(&mut self, bytes: Vec<u8>, reply: oneshot::Sender<Result<()>>) {
        let Some(stdin) = self.stdin.as_ref().filter(|_| self.state == TransportState::Running)
        else {
            let _ = reply.send(Err(AppError::TransportClosed("stdin is closed".into())));
            return;
        };

        match stdin.try_send(WriteRequest { bytes, reply }) {
            Ok(()) => {}
            Err(TrySendError::Full(req)) => {
                let _ = req.reply.send(Err(AppError::TransportClosed(
                    "stdin queue is full".into(),
                )));
            }
            Err(TrySendError::Closed(req)) => {
                let _ = req
                    .reply
                    .send(Err(AppError::TransportClosed("stdin is closed".into())));
            }
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    fn begin_stop(&mut self, mode: StopMode, reason: &str) {
        if matches!(
            self.state,
            TransportState::Draining | TransportState::Terminated
        ) {
            return;
        }
        if self.close_reason.is_none() {
            self.close_reason = Some(reason.to_owned());
        }

        match (self.stop.as_ref().map(|p| p.phase), mode) {
            (Some(phase), StopMode::Immediate) if phase != StopPhase::Killing => {
                self.kill_now();
            }
            (Some(_), _) => {}
            (None, StopMode::Immediate) => {
                info!(handle_id = self.handle_id, reason, "stopping agent immediately");
                self.set_state(TransportState::Stopping);
                self.kill_now();
            }
            (None, StopMode::Graceful) => {
                info!(handle_id = self.handle_id, reason, "stopping agent gracefully");
                self.set_state(TransportState::Stopping);
                self.stdin = None;
                self.stop = Some(StopProgress {
                    phase: StopPhase::ClosingStdin,
                    deadline: Instant::now() + self.options.close_grace,
                });
            }
        }
    }

    fn terminate(&mut self) {
        #[cfg(unix)]
        {
            match self.pid.ok_or_else(|| "pid unknown".to_owned()).and_then(send_sigterm) {
                Ok(()) => {
                    debug!(handle_id = self.handle_id, "sent SIGTERM");
                    self.stop = Some(StopProgress {
                        phase: StopPhase::Terminating,
                        deadline: Instant::now() + self.options.term_grace,
                    });
                }
                Err(err) => {
                    warn!(handle_id = self.handle_id, %err, "SIGTERM failed; killing");
                    self.kill_now();
                }
            }
        }
        #[cfg(not(unix))]
        {
            self.kill_now();
        }
    }

    fn kill_now(&mut self) {
        self.stdin = None;
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        self.stop = Some(StopProgress {
            phase: StopPhase::Killing,
            deadline: Instant::now() + self.options.kill_grace,
        });
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();

        if self.drain_deadline.is_some_and(|d| d <= now) {
            warn!(
                handle_id = self.handle_id,
                stdout_open = self.stdout_open,
                stderr_open = self.stderr_open,
                "drain timed out"
            );
            let reason = self.exit_reason();
            self.finalize(reason);
            return;
        }

        let due = self
            .stop
            .as_ref()
            .filter(|p| p.deadline <= now)
            .map(|p| p.phase);
        if let Some(phase) = due {
            match phase {
                StopPhase::ClosingStdin => {
                    debug!(handle_id = self.handle_id, "agent ignored stdin close");
                    self.terminate();
                }
                StopPhase::Terminating => {
                    debug!(handle_id = self.handle_id, "agent ignored SIGTERM");
                    self.kill_now();
                }
                StopPhase::Killing => {
                    warn!(handle_id = self.handle_id, "agent did not exit after kill; removing handle");
                    self.finalize("process did not exit; handle force-removed".into());
                }
            }
            return;
        }

        if self.idle_deadline.is_some_and(|d| d <= now) {
            self.idle_deadline = None;
            self.begin_stop(StopMode::Graceful, "idle: no subscribers or leases");
        }
    }

    fn refresh_idle(&mut self) {
        let idle = self.state == TransportState::Running
            && self.subscribers.is_empty()
            && self.leases == 0;
        match (self.options.idle_grace, idle) {
            (Some(grace), true) => {
                if self.idle_deadline.is_none() {
                    self.idle_deadline = Some(Instant::now() + grace);
                }
            }
            _ => self.idle_deadline = None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.drain_deadline,
            self.stop.as_ref().map(|p| p.deadline),
            self.idle_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn maybe_finish_drain(&mut self) {
        if self.exit.is_some() && !self.stdout_open && !self.stderr_open {
            let reason = self.exit_reason();
            self.finalize(reason);
        }
    }

    fn exit_reason(&mut self) -> String {
        match (self.close_reason.take(), &self.exit) {
            (Some(reason), _) => reason,
            (None, Some(exit)) => format!("process exited: {}", exit.reason),
            (None, None) => "process ended".to_owned(),
        }
    }

    fn finalize(&mut self, reason: String) {
        if self.finished {
            return;
        }
        self.flush_batch();

        info!(handle_id = self.handle_id, %reason, "transport closed");
        let exit = self.exit.clone();
        self.broadcast(&TransportEvent::Closed { reason, exit });
        self.subscribers.clear();

        self.stdin = None;
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        self.stop = None;
        self.drain_deadline = None;
        self.idle_deadline = None;
        self.set_state(TransportState::Terminated);

        let status = self.status();
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(status.clone());
        }
        self.finished = true;
    }

    fn set_state(&mut self, state: TransportState) {
        self.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn status(&self) -> TransportStatus {
        TransportStatus {
            handle_id: self.handle_id,
            pid: self.pid,
            state: self.state.clone(),
            subscribers: self.subscribers.len(),
            leases: self.leases,
            exit: self.exit.clone(),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::result::Result<(), String> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|e| e.to_string())
}
