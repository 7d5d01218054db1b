//! Connection actor and public API.
//!
//! The actor is the only owner of the pending-call table, the table of
//! unanswered server requests and the subscriber list. It never awaits a
//! stdin write: callers write their own requests after registering, and the
//! actor's own replies are written from spawned tasks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::approval::wire::unanswered_approval_result;
use crate::events::{to_event, Event};
use crate::rpc::pending::PendingTable;
use crate::rpc::{methods, rpc_error, ConnectionEvent, ConnectionOptions, ServerRequest};
use crate::transport::{InboundLine, ProcessHandle, Subscription, TransportEvent};
use crate::wire::message::{
    RequestId, RpcErrorObject, RpcMessage, INTERNAL_ERROR, METHOD_NOT_FOUND,
};
use crate::{AppError, Result};

const COMMAND_CAPACITY: usize = 256;

enum Command {
    Register {
        method: String,
        timeout: Duration,
        reply: oneshot::Sender<(RequestId, oneshot::Receiver<Result<Value>>)>,
    },
    Cancel(RequestId),
    Claim {
        id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::Receiver<ConnectionEvent>>,
    },
}

/// Cloneable client connection over one agent process.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    handle: ProcessHandle,
    commands: mpsc::Sender<Command>,
    options: ConnectionOptions,
    closed: watch::Receiver<Option<String>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.inner.handle)
            .field("closed", &*self.inner.closed.borrow())
            .finish()
    }
}

impl Connection {
    /// Subscribe to `handle` and start the connection actor.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] if the handle already terminated.
    pub async fn open(handle: ProcessHandle, options: ConnectionOptions) -> Result<Self> {
        let transport = handle.subscribe().await?;
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (closed_tx, closed) = watch::channel(None);

        let actor = ConnectionActor {
            handle: handle.clone(),
            transport,
            commands: command_rx,
            options: options.clone(),
            pending: PendingTable::new(),
            inbound: HashMap::new(),
            subscribers: Vec::new(),
            closed_tx,
        };
        tokio::spawn(actor.run());
        debug!(handle_id = handle.id(), "connection opened");

        Ok(Self {
            inner: Arc::new(Inner {
                handle,
                commands,
                options,
                closed,
            }),
        })
    }

    /// Underlying process handle.
    #[must_use]
    pub fn handle(&self) -> &ProcessHandle {
        &self.inner.handle
    }

    /// Options the connection was opened with.
    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Reason the connection closed, if it has.
    #[must_use]
    pub fn closed_reason(&self) -> Option<String> {
        self.inner.closed.borrow().clone()
    }

    /// Register a subscriber for events and server requests.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] once the connection closed.
    pub async fn subscribe(&self) -> Result<ConnectionEvents> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Subscribe { reply }).await?;
        let events = rx.await.map_err(|_| self.closed_error())?;
        Ok(ConnectionEvents { events })
    }

    /// Send a request with the default deadline.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] when the connection is closed
    /// or the write fails.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<CallHandle> {
        self.send_request_with_timeout(method, params, self.inner.options.request_timeout)
            .await
    }

    /// Send a request that the sweep fails after `timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send_request`].
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<CallHandle> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Register {
            method: method.to_owned(),
            timeout,
            reply,
        })
        .await?;
        let (id, response) = rx.await.map_err(|_| self.closed_error())?;

        let msg = self.inner.options.revision.request(&id, method, params);
        if let Err(err) = self.inner.handle.send_json(&msg).await {
            let _ = self.inner.commands.send(Command::Cancel(id)).await;
            return Err(err);
        }
        debug!(%id, method, "request sent");

        Ok(CallHandle {
            id,
            method: method.to_owned(),
            response,
        })
    }

    /// Send a request and wait for its result.
    ///
    /// # Errors
    ///
    /// Any send error, the mapped RPC error, [`AppError::Timeout`] from the
    /// sweep, or [`AppError::TransportClosed`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send_request(method, params).await?.wait().await
    }

    /// Send a fire-and-forget notification.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] if the write fails.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let msg = self.inner.options.revision.notification(method, params);
        self.inner.handle.send_json(&msg).await
    }

    /// Stop waiting for `id` locally, then tell the agent best-effort.
    ///
    /// The waiter receives [`AppError::Cancelled`]. The remote notice is
    /// sent in the background.
    pub async fn cancel(&self, id: &RequestId) {
        if self.command(Command::Cancel(id.clone())).await.is_err() {
            return;
        }
        let notice = self
            .inner
            .options
            .revision
            .notification(methods::CANCEL_REQUEST, Some(json!({ "id": id })));
        let handle = self.inner.handle.clone();
        tokio::spawn(async move {
            if let Err(err) = handle.send_json(&notice).await {
                debug!(%err, "cancel notice not delivered");
            }
        });
    }

    /// Answer a server request with a result.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if the request was already answered
    /// (for example by the deadline sweep), or a transport error.
    pub async fn respond(&self, id: &RequestId, result: Value) -> Result<()> {
        self.claim(id).await?;
        let msg = self.inner.options.revision.response(id, result);
        self.inner.handle.send_json(&msg).await
    }

    /// Answer a server request with an error.
    ///
    /// # Errors
    ///
    /// Same as [`Self::respond`].
    pub async fn respond_error(&self, id: &RequestId, error: &RpcErrorObject) -> Result<()> {
        self.claim(id).await?;
        let msg = self.inner.options.revision.error_response(id, error);
        self.inner.handle.send_json(&msg).await
    }

    async fn claim(&self, id: &RequestId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Claim {
            id: id.clone(),
            reply,
        })
        .await?;
        if rx.await.map_err(|_| self.closed_error())? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!(
                "no outstanding server request with id {id}"
            )))
        }
    }

    async fn command(&self, cmd: Command) -> Result<()> {
        self.inner
            .commands
            .send(cmd)
            .await
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> AppError {
        AppError::TransportClosed(
            self.closed_reason()
                .unwrap_or_else(|| "connection closed".to_owned()),
        )
    }
}

/// Awaitable reply to one request.
#[derive(Debug)]
pub struct CallHandle {
    id: RequestId,
    method: String,
    response: oneshot::Receiver<Result<Value>>,
}

impl CallHandle {
    /// Request id.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Request method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the result.
    ///
    /// # Errors
    ///
    /// The mapped RPC error, [`AppError::Timeout`], [`AppError::Cancelled`]
    /// or [`AppError::TransportClosed`].
    pub async fn wait(self) -> Result<Value> {
        self.response
            .await
            .map_err(|_| AppError::TransportClosed("connection closed".into()))?
    }
}

/// Event stream for one connection subscriber.
///
/// Ends after [`ConnectionEvent::Closed`], or without it if the subscriber
/// fell behind and was dropped.
#[derive(Debug)]
pub struct ConnectionEvents {
    events: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionEvents {
    /// Next event, or `None` when the stream ended.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct InboundRequest {
    method: String,
    deadline: Instant,
}

struct ConnectionActor {
    handle: ProcessHandle,
    transport: Subscription,
    commands: mpsc::Receiver<Command>,
    options: ConnectionOptions,
    pending: PendingTable,
    inbound: HashMap<RequestId, InboundRequest>,
    subscribers: Vec<mpsc::Sender<ConnectionEvent>>,
    closed_tx: watch::Sender<Option<String>>,
}

impl ConnectionActor {
    async fn run(mut self) {
        let mut sweep = interval(self.options.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break "connection dropped".to_owned(),
                },
                event = self.transport.recv() => match event {
                    Some(TransportEvent::Lines(batch)) => {
                        for line in batch.iter() {
                            self.handle_line(line);
                        }
                    }
                    Some(TransportEvent::Stderr(_)) => {}
                    Some(TransportEvent::Closed { reason, .. }) => break reason,
                    None => break "transport subscription lost".to_owned(),
                },
                _ = sweep.tick() => self.sweep(),
            }
        };

        self.close(reason);
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Register {
                method,
                timeout,
                reply,
            } => {
                let registered = self.pending.register(&method, Instant::now() + timeout);
                let id = registered.0.clone();
                if reply.send(registered).is_err() {
                    self.pending.cancel(&id);
                }
            }
            Command::Cancel(id) => {
                if let Some(method) = self.pending.cancel(&id) {
                    debug!(%id, method, "request cancelled locally");
                }
            }
            Command::Claim { id, reply } => {
                let _ = reply.send(self.inbound.remove(&id).is_some());
            }
            Command::Subscribe { reply } => {
                let (tx, rx) = mpsc::channel(self.options.event_capacity.max(1));
                if reply.send(rx).is_ok() {
                    self.subscribers.push(tx);
                }
            }
        }
    }

    fn handle_line(&mut self, line: &InboundLine) {
        let value = match line {
            InboundLine::Json(value) => value.clone(),
            InboundLine::Invalid { raw, error } => {
                warn!(%error, "undecodable line from agent");
                self.broadcast(&ConnectionEvent::Event(Event::DecodeError {
                    raw: raw.clone(),
                    error: error.clone(),
                }));
                return;
            }
        };

        match RpcMessage::classify(value) {
            Err(err) => warn!(%err, "discarding malformed message"),
            Ok(RpcMessage::Response { id, outcome }) => {
                if !self.pending.resolve(&id, outcome.map_err(rpc_error)) {
                    warn!(%id, "response for unknown request id; discarded");
                }
            }
            Ok(RpcMessage::Notification { method, params }) => {
                self.broadcast(&ConnectionEvent::Event(to_event(&method, &params)));
            }
            Ok(RpcMessage::Request { id, method, params }) => {
                self.handle_server_request(id, method, params);
            }
        }
    }

    fn handle_server_request(&mut self, id: RequestId, method: String, params: Value) {
        if !methods::is_known_server_request(&method) {
            debug!(%id, method, "unsupported server request");
            self.reply_error(
                &id,
                &RpcErrorObject::new(METHOD_NOT_FOUND, format!("method not found: {method}")),
            );
            return;
        }
        if self.inbound.contains_key(&id) {
            warn!(%id, method, "duplicate server request id; ignored");
            return;
        }

        self.inbound.insert(
            id.clone(),
            InboundRequest {
                method: method.clone(),
                deadline: Instant::now() + self.options.server_request_timeout,
            },
        );
        self.broadcast(&ConnectionEvent::ServerRequest(ServerRequest {
            id: id.clone(),
            method: method.clone(),
            params,
        }));

        if self.subscribers.is_empty() {
            self.inbound.remove(&id);
            info!(%id, method, "no subscriber for server request; answering");
            self.reply_unanswered(&id, &method);
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();

        for id in self.pending.sweep(now) {
            debug!(%id, "request timed out");
        }

        let expired: Vec<RequestId> = self
            .inbound
            .iter()
            .filter(|(_, req)| req.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(req) = self.inbound.remove(&id) {
                warn!(%id, method = req.method, "server request unanswered before deadline");
                self.reply_unanswered(&id, &req.method);
            }
        }
    }

    /// Answer a server request nobody answered: approvals are declined,
    /// anything else gets an error.
    fn reply_unanswered(&self, id: &RequestId, method: &str) {
        if methods::is_approval(method) {
            let msg = self
                .options
                .revision
                .response(id, unanswered_approval_result(method));
            self.write(msg);
        } else {
            self.reply_error(
                id,
                &RpcErrorObject::new(INTERNAL_ERROR, "request was not answered before its deadline"),
            );
        }
    }

    fn reply_error(&self, id: &RequestId, error: &RpcErrorObject) {
        self.write(self.options.revision.error_response(id, error));
    }

    fn write(&self, msg: Value) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            if let Err(err) = handle.send_json(&msg).await {
                debug!(%err, "reply not delivered");
            }
        });
    }

    fn broadcast(&mut self, event: &ConnectionEvent) {
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("connection subscriber lagging; dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn close(&mut self, reason: String) {
        let failed = self
            .pending
            .fail_all(&AppError::TransportClosed(reason.clone()));

        let unanswered: Vec<(RequestId, String)> = self
            .inbound
            .drain()
            .map(|(id, req)| (id, req.method))
            .collect();
        for (id, method) in &unanswered {
            self.reply_unanswered(id, method);
        }

        info!(
            %reason,
            failed_calls = failed,
            unanswered = unanswered.len(),
            "connection closed"
        );
        self.broadcast(&ConnectionEvent::Closed {
            reason: reason.clone(),
        });
        self.subscribers.clear();
        self.closed_tx.send_replace(Some(reason));
    }
}
