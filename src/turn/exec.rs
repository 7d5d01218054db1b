//! Dialect A turns.
//!
//! The agent is started for a single turn and writes its events to stdout
//! until `turn.completed` or `turn.failed`. Lines the process wrote before
//! anyone subscribed are replayed from the transport backlog.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{Interrupt, TurnContext, TurnEvent, TurnHandle, TurnStream};
use crate::events::stream::decode_inbound;
use crate::transport::{ProcessHandle, Subscription, TransportEvent};
use crate::Result;

const TURN_EVENT_CAPACITY: usize = 256;

/// Consume one turn from a Dialect A process.
///
/// # Errors
///
/// Returns [`crate::AppError::TransportClosed`] if the handle already
/// terminated.
pub async fn exec_turn(handle: &ProcessHandle, timeout: Duration) -> Result<TurnStream> {
    let subscription = handle.subscribe().await?;
    let context = TurnContext::new(None, None, timeout);
    let (turn_handle, cancelled) = TurnHandle::new(Interrupt::Process(handle.clone()));
    let (tx, rx) = mpsc::channel(TURN_EVENT_CAPACITY);
    let stream = TurnStream::new(rx, turn_handle, &context);

    tokio::spawn(drive(handle.id(), context, subscription, tx, cancelled));
    Ok(stream)
}

async fn drive(
    handle_id: u64,
    mut context: TurnContext,
    mut subscription: Subscription,
    tx: mpsc::Sender<TurnEvent>,
    mut cancelled: watch::Receiver<bool>,
) {
    let deadline = tokio::time::sleep_until(context.deadline());
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            changed = cancelled.changed() => {
                if changed.is_err() || *cancelled.borrow() {
                    let _ = tx.send(TurnEvent::Cancelled).await;
                    return;
                }
            }
            () = &mut deadline => {
                warn!(handle_id, "exec turn timed out");
                let _ = tx.send(TurnEvent::TimedOut).await;
                return;
            }
            item = subscription.recv() => match item {
                Some(TransportEvent::Lines(lines)) => {
                    for line in lines.iter() {
                        let event = decode_inbound(line);
                        context.adopt(&event);
                        let terminal = event.is_terminal();
                        if tx.send(TurnEvent::Event(event)).await.is_err() || terminal {
                            return;
                        }
                    }
                }
                Some(TransportEvent::Stderr(line)) => {
                    debug!(handle_id, %line, "agent stderr");
                }
                Some(TransportEvent::Closed { reason, exit }) => {
                    let error = match exit {
                        Some(exit) => format!("{reason} ({})", exit.reason),
                        None => reason,
                    };
                    let _ = tx.send(TurnEvent::Failed { error }).await;
                    return;
                }
                None => {
                    let _ = tx
                        .send(TurnEvent::Failed {
                            error: "transport subscription dropped".into(),
                        })
                        .await;
                    return;
                }
            },
        }
    }
}
