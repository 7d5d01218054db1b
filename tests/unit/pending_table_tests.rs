//! Unit tests for the pending-call table.

use std::time::Duration;

use agent_conduit::rpc::pending::PendingTable;
use agent_conduit::wire::message::RequestId;
use agent_conduit::AppError;
use serde_json::json;
use tokio::time::Instant;

#[tokio::test]
async fn ids_are_unique_and_resolve_once() {
    let mut table = PendingTable::new();
    let deadline = Instant::now() + Duration::from_secs(60);
    let (first, first_rx) = table.register("initialize", deadline);
    let (second, second_rx) = table.register("thread/start", deadline);

    assert_eq!(first, RequestId::Int(1));
    assert_eq!(second, RequestId::Int(2));
    assert_eq!(table.len(), 2);

    assert!(table.resolve(&second, Ok(json!({"thread": {"id": "t"}}))));
    assert!(!table.resolve(&second, Ok(json!(null))), "second resolve ignored");
    assert!(!table.resolve(&RequestId::Int(99), Ok(json!(null))));

    let value = second_rx.await.expect("sender kept").expect("ok outcome");
    assert_eq!(value["thread"]["id"], "t");
    assert!(table.contains(&first));
    drop(first_rx);
}

#[tokio::test]
async fn sweep_fails_only_expired_calls() {
    let mut table = PendingTable::new();
    let now = Instant::now();
    let (stale, stale_rx) = table.register("turn/start", now);
    let (fresh, _fresh_rx) = table.register("thread/start", now + Duration::from_secs(60));

    let swept = table.sweep(now);
    assert_eq!(swept, vec![stale]);
    assert!(table.contains(&fresh));
    assert!(matches!(
        stale_rx.await.expect("completed"),
        Err(AppError::Timeout(_))
    ));
}

#[tokio::test]
async fn cancel_and_fail_all() {
    let mut table = PendingTable::new();
    let deadline = Instant::now() + Duration::from_secs(60);
    let (a, a_rx) = table.register("a", deadline);
    let (_b, b_rx) = table.register("b", deadline);

    assert_eq!(table.cancel(&a).as_deref(), Some("a"));
    assert!(table.cancel(&a).is_none());
    assert!(matches!(a_rx.await.expect("done"), Err(AppError::Cancelled(_))));

    let failed = table.fail_all(&AppError::TransportClosed("exit".into()));
    assert_eq!(failed, 1);
    assert!(table.is_empty());
    assert!(matches!(
        b_rx.await.expect("done"),
        Err(AppError::TransportClosed(_))
    ));
}

#[test]
fn in_flight_ids_are_not_reused() {
    let mut table = PendingTable::new();
    let deadline = Instant::now() + Duration::from_secs(60);
    let (one, _rx1) = table.register("x", deadline);
    let (two, _rx2) = table.register("y", deadline);
    assert!(table.resolve(&one, Ok(json!(null))));
    let (three, _rx3) = table.register("z", deadline);
    assert_ne!(three, two);
    assert_eq!(three, RequestId::Int(3));
}
