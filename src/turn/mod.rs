//! Turn orchestration.
//!
//! A turn runs in a background task that forwards [`TurnEvent`]s to a
//! single-pass [`TurnStream`]. The stream ends after exactly one terminal
//! item: the matching completion or failure event, [`TurnEvent::TimedOut`],
//! [`TurnEvent::Cancelled`] or [`TurnEvent::Failed`].
//!
//! - `session`: Dialect B (`turn/start` over a [`crate::rpc::Connection`]).
//! - `exec`: Dialect A (a flowing event stream from one process).

pub mod exec;
pub mod session;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

pub use exec::exec_turn;
pub use session::TurnOrchestrator;

use crate::approval::{ApprovalRequest, Disposition};
use crate::events::{Event, TokenUsage};
use crate::rpc::{thread::interrupt_turn, Connection};
use crate::transport::{ProcessHandle, StopMode};
use crate::wire::message::{RequestId, RpcErrorObject, INTERNAL_ERROR};
use crate::Result;

/// Identity and deadline of one running turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnContext {
    /// Thread the turn belongs to. Learned from the stream in Dialect A.
    pub thread_id: Option<String>,
    /// Turn id, when the protocol assigns one.
    pub turn_id: Option<String>,
    /// When the turn was requested.
    pub started_at: Instant,
    /// Completion deadline relative to `started_at`.
    pub timeout: Duration,
}

impl TurnContext {
    /// Context starting now.
    #[must_use]
    pub fn new(thread_id: Option<String>, turn_id: Option<String>, timeout: Duration) -> Self {
        Self {
            thread_id,
            turn_id,
            started_at: Instant::now(),
            timeout,
        }
    }

    /// Absolute completion deadline.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.started_at + self.timeout
    }

    /// Whether `event` belongs to this turn. Missing ids on either side match.
    #[must_use]
    pub fn owns(&self, event: &Event) -> bool {
        event.matches(self.thread_id.as_deref(), self.turn_id.as_deref())
    }

    /// Fill in ids the agent announces.
    pub fn adopt(&mut self, event: &Event) {
        match event {
            Event::ThreadStarted { thread_id } if self.thread_id.is_none() => {
                self.thread_id = Some(thread_id.clone());
            }
            Event::TurnStarted {
                turn_id: Some(turn_id),
                ..
            } if self.turn_id.is_none() => {
                self.turn_id = Some(turn_id.clone());
            }
            _ => {}
        }
    }
}

/// A question from the agent that the caller must answer.
#[derive(Debug, Clone)]
pub struct UserInputRequest {
    /// Server request id.
    pub id: RequestId,
    /// Parameters as received (questions, options).
    pub params: Value,
    conn: Connection,
}

impl UserInputRequest {
    /// Answer with a result object.
    ///
    /// # Errors
    ///
    /// [`crate::AppError::NotFound`] if the request was already answered
    /// (for example by the deadline sweep), or a transport error.
    pub async fn respond(&self, result: Value) -> Result<()> {
        self.conn.respond(&self.id, result).await
    }

    /// Answer with an empty set of answers.
    ///
    /// # Errors
    ///
    /// Same as [`Self::respond`].
    pub async fn skip(&self) -> Result<()> {
        self.respond(json!({ "answers": {} })).await
    }

    /// Refuse with an error.
    ///
    /// # Errors
    ///
    /// Same as [`Self::respond`].
    pub async fn reject(&self, message: &str) -> Result<()> {
        self.conn
            .respond_error(&self.id, &RpcErrorObject::new(INTERNAL_ERROR, message))
            .await
    }
}

/// Item yielded by a [`TurnStream`].
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Agent event belonging to this turn.
    Event(Event),
    /// The agent asked the user something.
    UserInput(UserInputRequest),
    /// An approval for this turn reached its disposition.
    ApprovalResolved {
        /// The request.
        request: ApprovalRequest,
        /// Its outcome.
        disposition: Disposition,
    },
    /// No terminal event before the deadline.
    TimedOut,
    /// The caller cancelled.
    Cancelled,
    /// The transport or connection failed.
    Failed {
        /// Why.
        error: String,
    },
}

impl TurnEvent {
    /// Whether nothing follows this item.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Event(event) => event.is_terminal(),
            Self::TimedOut | Self::Cancelled | Self::Failed { .. } => true,
            Self::UserInput(_) | Self::ApprovalResolved { .. } => false,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    /// Completion event received.
    Completed {
        /// Agent-reported status string, if any.
        status: Option<String>,
    },
    /// Failure event received.
    Failed {
        /// Agent-reported message.
        message: String,
    },
    /// Deadline elapsed.
    TimedOut,
    /// Cancelled by the caller.
    Cancelled,
    /// Transport or connection failure.
    TransportClosed {
        /// Why.
        reason: String,
    },
}

/// Everything observed during a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Thread id, if known.
    pub thread_id: Option<String>,
    /// Turn id, if known.
    pub turn_id: Option<String>,
    /// Terminal status.
    pub status: TurnStatus,
    /// Agent events in arrival order, including the terminal one.
    pub events: Vec<Event>,
    /// Last usage figures reported.
    pub usage: Option<TokenUsage>,
    /// Final agent message text.
    pub final_message: Option<String>,
    /// Latest aggregated diff.
    pub diff: Option<String>,
    /// Approval dispositions observed, in order.
    pub approvals: Vec<(RequestId, Disposition)>,
}

#[derive(Clone)]
enum Interrupt {
    Rpc {
        conn: Connection,
        thread_id: String,
        turn_id: String,
    },
    Process(ProcessHandle),
}

/// Cancels a running turn. Cloneable.
#[derive(Clone)]
pub struct TurnHandle {
    cancelled: Arc<watch::Sender<bool>>,
    interrupt: Interrupt,
}

impl fmt::Debug for TurnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnHandle")
            .field("cancelled", &*self.cancelled.borrow())
            .finish_non_exhaustive()
    }
}

impl TurnHandle {
    fn new(interrupt: Interrupt) -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                cancelled: Arc::new(tx),
                interrupt,
            },
            rx,
        )
    }

    /// Stop waiting for the turn now.
    ///
    /// Dialect B turns also get a best-effort `turn/interrupt`; Dialect A
    /// processes are stopped gracefully. Both happen in the background.
    /// Must be called within a tokio runtime. Repeated calls do nothing.
    pub fn cancel(&self) {
        if self.cancelled.send_replace(true) {
            return;
        }
        match self.interrupt.clone() {
            Interrupt::Rpc {
                conn,
                thread_id,
                turn_id,
            } => {
                tokio::spawn(async move {
                    if let Err(err) = interrupt_turn(&conn, &thread_id, &turn_id).await {
                        debug!(%err, %turn_id, "interrupt not delivered");
                    }
                });
            }
            Interrupt::Process(handle) => {
                tokio::spawn(async move {
                    handle.stop(StopMode::Graceful).await;
                });
            }
        }
    }

    /// Whether [`Self::cancel`] was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

/// Single-pass stream of one turn's items.
#[derive(Debug)]
pub struct TurnStream {
    events: mpsc::Receiver<TurnEvent>,
    handle: TurnHandle,
    thread_id: Option<String>,
    turn_id: Option<String>,
    finished: bool,
}

impl TurnStream {
    fn new(events: mpsc::Receiver<TurnEvent>, handle: TurnHandle, context: &TurnContext) -> Self {
        Self {
            events,
            handle,
            thread_id: context.thread_id.clone(),
            turn_id: context.turn_id.clone(),
            finished: false,
        }
    }

    /// Handle for cancelling this turn.
    #[must_use]
    pub fn handle(&self) -> TurnHandle {
        self.handle.clone()
    }

    /// Thread id, once known.
    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// Turn id, once known.
    #[must_use]
    pub fn turn_id(&self) -> Option<&str> {
        self.turn_id.as_deref()
    }

    /// Next item. `None` after the terminal item.
    pub async fn next(&mut self) -> Option<TurnEvent> {
        if self.finished {
            return None;
        }
        let Some(item) = self.events.recv().await else {
            self.finished = true;
            return None;
        };
        if let TurnEvent::Event(event) = &item {
            match event {
                Event::ThreadStarted { thread_id } if self.thread_id.is_none() => {
                    self.thread_id = Some(thread_id.clone());
                }
                Event::TurnStarted {
                    turn_id: Some(turn_id),
                    ..
                } if self.turn_id.is_none() => {
                    self.turn_id = Some(turn_id.clone());
                }
                _ => {}
            }
        }
        if item.is_terminal() {
            self.finished = true;
        }
        Some(item)
    }

    /// Drain the stream into a [`TurnOutcome`].
    ///
    /// User-input requests are skipped with an empty answer.
    pub async fn collect(mut self) -> TurnOutcome {
        let mut acc = Accumulator::default();
        let mut status = None;

        while let Some(item) = self.next().await {
            match item {
                TurnEvent::Event(event) => {
                    if let Some(terminal) = acc.push(event) {
                        status = Some(terminal);
                    }
                }
                TurnEvent::UserInput(request) => {
                    if let Err(err) = request.skip().await {
                        debug!(%err, "user input not answered");
                    }
                }
                TurnEvent::ApprovalResolved {
                    request,
                    disposition,
                } => acc.approvals.push((request.id, disposition)),
                TurnEvent::TimedOut => status = Some(TurnStatus::TimedOut),
                TurnEvent::Cancelled => status = Some(TurnStatus::Cancelled),
                TurnEvent::Failed { error } => {
                    status = Some(TurnStatus::TransportClosed { reason: error });
                }
            }
        }

        TurnOutcome {
            thread_id: self.thread_id,
            turn_id: self.turn_id,
            status: status.unwrap_or_else(|| TurnStatus::TransportClosed {
                reason: "turn stream ended".into(),
            }),
            final_message: acc.final_message(),
            events: acc.events,
            usage: acc.usage,
            diff: acc.diff,
            approvals: acc.approvals,
        }
    }
}

#[derive(Default)]
struct Accumulator {
    events: Vec<Event>,
    usage: Option<TokenUsage>,
    diff: Option<String>,
    completed_message: Option<String>,
    deltas: Vec<(String, String)>,
    approvals: Vec<(RequestId, Disposition)>,
}

impl Accumulator {
    fn push(&mut self, event: Event) -> Option<TurnStatus> {
        let status = match &event {
            Event::AgentMessageDelta { item_id, delta, .. } => {
                match self.deltas.iter_mut().find(|(id, _)| id == item_id) {
                    Some((_, text)) => text.push_str(delta),
                    None => self.deltas.push((item_id.clone(), delta.clone())),
                }
                None
            }
            Event::ItemCompleted { item, .. }
                if matches!(item.kind.as_str(), "agentMessage" | "agent_message") =>
            {
                if item.text.is_some() {
                    self.completed_message.clone_from(&item.text);
                }
                None
            }
            Event::TurnDiffUpdated { diff, .. } => {
                self.diff = Some(diff.clone());
                None
            }
            Event::TokenUsageUpdated { usage, .. } => {
                self.usage = Some(usage.clone());
                None
            }
            Event::TurnCompleted { status, usage, .. } => {
                if usage.is_some() {
                    self.usage.clone_from(usage);
                }
                Some(TurnStatus::Completed {
                    status: status.clone(),
                })
            }
            Event::TurnFailed { message, .. } => Some(TurnStatus::Failed {
                message: message.clone(),
            }),
            _ => None,
        };
        self.events.push(event);
        status
    }

    fn final_message(&self) -> Option<String> {
        self.completed_message
            .clone()
            .or_else(|| self.deltas.last().map(|(_, text)| text.clone()))
    }
}
