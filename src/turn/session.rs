//! Dialect B turns.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};

use super::{Interrupt, TurnContext, TurnEvent, TurnHandle, TurnStream, UserInputRequest};
use crate::approval::negotiator::approval_span;
use crate::approval::{ApprovalContext, ApprovalNegotiator, ApprovalRequest};
use crate::events::fields;
use crate::rpc::thread::{interrupt_turn, start_thread, turn_id_from_result, turn_start_params};
use crate::rpc::{methods, Connection, ConnectionEvent, ConnectionEvents, ServerRequest};
use crate::{AppError, Result};

const TURN_EVENT_CAPACITY: usize = 256;

/// Runs turns on one connection.
#[derive(Debug, Clone)]
pub struct TurnOrchestrator {
    conn: Connection,
    negotiator: ApprovalNegotiator,
    turn_timeout: Duration,
}

impl TurnOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(conn: Connection, negotiator: ApprovalNegotiator, turn_timeout: Duration) -> Self {
        Self {
            conn,
            negotiator,
            turn_timeout,
        }
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The approval negotiator used for this connection's turns.
    #[must_use]
    pub fn negotiator(&self) -> &ApprovalNegotiator {
        &self.negotiator
    }

    /// Start a thread.
    ///
    /// # Errors
    ///
    /// See [`start_thread`].
    pub async fn start_thread(&self, params: Value) -> Result<String> {
        start_thread(&self.conn, params).await
    }

    /// Start a turn and return its event stream.
    ///
    /// Notifications and server requests that arrive while `turn/start` is
    /// in flight are buffered and replayed once the turn id is known.
    ///
    /// # Errors
    ///
    /// Any error from `turn/start`, or [`AppError::Protocol`] if its result
    /// carries no turn id.
    pub async fn run_turn(
        &self,
        thread_id: &str,
        input: Value,
        overrides: Option<&Value>,
    ) -> Result<TurnStream> {
        let mut events = self.conn.subscribe().await?;
        let call = self
            .conn
            .send_request(
                methods::TURN_START,
                Some(turn_start_params(thread_id, input, overrides)),
            )
            .await?;

        let mut buffered = VecDeque::new();
        let wait = call.wait();
        tokio::pin!(wait);
        let result = loop {
            tokio::select! {
                result = &mut wait => break result?,
                item = events.recv() => match item {
                    Some(ConnectionEvent::Closed { reason }) => {
                        return Err(AppError::TransportClosed(reason));
                    }
                    Some(item) => buffered.push_back(item),
                    None => {
                        return Err(AppError::TransportClosed(
                            "connection event stream ended".into(),
                        ));
                    }
                },
            }
        };
        let turn_id = turn_id_from_result(&result)?;
        info!(thread_id, turn_id = %turn_id, buffered = buffered.len(), "turn started");

        let context = TurnContext::new(
            Some(thread_id.to_owned()),
            Some(turn_id.clone()),
            self.turn_timeout,
        );
        let (handle, cancelled) = TurnHandle::new(Interrupt::Rpc {
            conn: self.conn.clone(),
            thread_id: thread_id.to_owned(),
            turn_id,
        });
        let (tx, rx) = mpsc::channel(TURN_EVENT_CAPACITY);
        let stream = TurnStream::new(rx, handle, &context);

        let driver = SessionDriver {
            conn: self.conn.clone(),
            negotiator: self.negotiator.clone(),
            context,
            tx,
        };
        tokio::spawn(driver.run(buffered, events, cancelled));
        Ok(stream)
    }
}

struct SessionDriver {
    conn: Connection,
    negotiator: ApprovalNegotiator,
    context: TurnContext,
    tx: mpsc::Sender<TurnEvent>,
}

enum Flow {
    Continue,
    Done,
}

impl SessionDriver {
    async fn run(
        self,
        mut buffered: VecDeque<ConnectionEvent>,
        mut events: ConnectionEvents,
        mut cancelled: watch::Receiver<bool>,
    ) {
        while let Some(item) = buffered.pop_front() {
            if matches!(self.handle(item).await, Flow::Done) {
                return;
            }
        }

        let deadline = tokio::time::sleep_until(self.context.deadline());
        tokio::pin!(deadline);

        loop {
            let flow = tokio::select! {
                biased;
                changed = cancelled.changed() => {
                    if changed.is_err() || *cancelled.borrow() {
                        self.emit(TurnEvent::Cancelled).await;
                        Flow::Done
                    } else {
                        Flow::Continue
                    }
                }
                () = &mut deadline => {
                    warn!(
                        turn_id = self.context.turn_id.as_deref().unwrap_or_default(),
                        "turn timed out"
                    );
                    self.interrupt();
                    self.emit(TurnEvent::TimedOut).await;
                    Flow::Done
                }
                item = events.recv() => match item {
                    Some(item) => self.handle(item).await,
                    None => {
                        self.emit(TurnEvent::Failed {
                            error: "connection event stream ended".into(),
                        })
                        .await;
                        Flow::Done
                    }
                },
            };
            if matches!(flow, Flow::Done) {
                return;
            }
        }
    }

    async fn handle(&self, item: ConnectionEvent) -> Flow {
        match item {
            ConnectionEvent::Event(event) => {
                if !self.context.owns(&event) {
                    return Flow::Continue;
                }
                let terminal = event.is_terminal();
                if !self.emit(TurnEvent::Event(event)).await || terminal {
                    return Flow::Done;
                }
                Flow::Continue
            }
            ConnectionEvent::ServerRequest(request) => {
                self.route(request).await;
                Flow::Continue
            }
            ConnectionEvent::Closed { reason } => {
                self.negotiator.fail_all(&reason);
                self.emit(TurnEvent::Failed { error: reason }).await;
                Flow::Done
            }
        }
    }

    async fn route(&self, request: ServerRequest) {
        let thread = self.context.thread_id.as_deref().unwrap_or_default();
        let turn = self.context.turn_id.as_deref();

        if let Some(approval) = ApprovalRequest::from_server_request(&request) {
            if !approval.matches(thread, turn) {
                debug!(request_id = %approval.id, "approval for another turn");
                return;
            }
            let conn = self.conn.clone();
            let negotiator = self.negotiator.clone();
            let tx = self.tx.clone();
            let context = ApprovalContext {
                thread_id: self.context.thread_id.clone(),
                turn_id: self.context.turn_id.clone(),
            };
            let span = approval_span(&approval);
            tokio::spawn(
                async move {
                    let disposition = negotiator.decide(approval.clone(), context).await;
                    // Forwarded before the reply, so it precedes anything the
                    // agent does with the decision.
                    let resolved = TurnEvent::ApprovalResolved {
                        request: approval.clone(),
                        disposition: disposition.clone(),
                    };
                    if tx.send(resolved).await.is_err() {
                        debug!("turn stream gone; approval outcome not forwarded");
                    }
                    ApprovalNegotiator::answer(&conn, &approval, &disposition).await;
                }
                .instrument(span),
            );
            return;
        }

        if request.method == methods::REQUEST_USER_INPUT {
            if !owned_by(&request.params, thread, turn) {
                return;
            }
            self.emit(TurnEvent::UserInput(UserInputRequest {
                id: request.id,
                params: request.params,
                conn: self.conn.clone(),
            }))
            .await;
        }
    }

    fn interrupt(&self) {
        let (Some(thread), Some(turn)) = (
            self.context.thread_id.clone(),
            self.context.turn_id.clone(),
        ) else {
            return;
        };
        let conn = self.conn.clone();
        tokio::spawn(async move {
            if let Err(err) = interrupt_turn(&conn, &thread, &turn).await {
                debug!(%err, "interrupt not delivered");
            }
        });
    }

    /// Forward an item. Returns false once the stream was dropped.
    async fn emit(&self, item: TurnEvent) -> bool {
        self.tx.send(item).await.is_ok()
    }
}

/// Whether a server request's params name this turn. Missing ids match.
fn owned_by(params: &Value, thread: &str, turn: Option<&str>) -> bool {
    let thread_ok = fields::thread_id(params).is_none_or(|owner| owner == thread);
    let turn_ok = match (fields::turn_id(params), turn) {
        (Some(owner), Some(turn)) => owner == turn,
        _ => true,
    };
    thread_ok && turn_ok
}
