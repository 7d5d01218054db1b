//! Integration tests for the process transport.
//!
//! Covers fan-out ordering, per-line decode failures, the pre-subscriber
//! backlog, stdin writes, shutdown escalation, idle auto-stop, leases and
//! output drained after exit.

use std::time::{Duration, Instant};

use agent_conduit::transport::{
    InboundLine, ProcessHandle, ProcessSpec, StopMode, Transport, TransportEvent,
    TransportOptions, TransportState,
};
use agent_conduit::AppError;
use serde_json::json;

use super::test_helpers::{drain, fast_options, sh, WAIT};

fn numbers(lines: &[InboundLine]) -> Vec<u64> {
    lines
        .iter()
        .map(|line| match line {
            InboundLine::Json(value) => value["n"].as_u64().expect("n field"),
            InboundLine::Invalid { raw, .. } => panic!("unexpected invalid line {raw:?}"),
        })
        .collect()
}

// ── Fan-out ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn subscribers_see_identical_sequences() {
    let script = "read go; i=1; while [ $i -le 300 ]; do printf '{\"n\":%d}\\n' $i; i=$((i+1)); done";
    let handle = ProcessHandle::start(&sh(script), fast_options()).expect("spawn");
    let mut first = handle.subscribe().await.expect("first subscriber");
    let mut second = handle.subscribe().await.expect("second subscriber");
    handle.send("go\n").await.expect("release script");

    let (a, _, closed_a) = drain(&mut first).await;
    let (b, _, closed_b) = drain(&mut second).await;

    let expected: Vec<u64> = (1..=300).collect();
    assert_eq!(numbers(&a), expected);
    assert_eq!(a, b, "every subscriber sees the same lines in the same order");
    assert_eq!(closed_a, closed_b);
    match closed_a {
        TransportEvent::Closed { exit, .. } => {
            assert_eq!(exit.expect("exit observed").code, Some(0));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(handle.state(), TransportState::Terminated);
}

#[tokio::test]
async fn invalid_line_is_reported_and_stream_continues() {
    let script = "read go; printf '{\"a\":1}\\nnot json\\n\\n{\"b\":2}\\n'";
    let handle = ProcessHandle::start(&sh(script), fast_options()).expect("spawn");
    let mut sub = handle.subscribe().await.expect("subscribe");
    handle.send("go\n").await.expect("release script");

    let (lines, _, _) = drain(&mut sub).await;
    assert_eq!(lines.len(), 3, "blank lines are skipped: {lines:?}");
    assert_eq!(lines[0], InboundLine::Json(json!({"a": 1})));
    assert!(matches!(&lines[1], InboundLine::Invalid { raw, .. } if raw == "not json"));
    assert_eq!(lines[2], InboundLine::Json(json!({"b": 2})));
}

#[tokio::test]
async fn oversized_line_is_reported_without_its_content() {
    let options = TransportOptions {
        max_line_bytes: 16,
        ..fast_options()
    };
    let script = "read go; printf '{\"long\":\"aaaaaaaaaaaaaaaaaaaaaaaa\"}\\n{\"n\":1}\\n'";
    let handle = ProcessHandle::start(&sh(script), options).expect("spawn");
    let mut sub = handle.subscribe().await.expect("subscribe");
    handle.send("go\n").await.expect("release script");

    let (lines, _, _) = drain(&mut sub).await;
    assert_eq!(lines.len(), 2, "{lines:?}");
    assert!(matches!(&lines[0], InboundLine::Invalid { raw, .. } if raw.is_empty()));
    assert_eq!(lines[1], InboundLine::Json(json!({"n": 1})));
}

#[tokio::test]
async fn backlog_is_replayed_to_first_subscriber() {
    let script = "printf '{\"n\":1}\\n{\"n\":2}\\n'; read _";
    let handle = ProcessHandle::start(&sh(script), fast_options()).expect("spawn");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut sub = handle.subscribe().await.expect("subscribe");
    let mut seen = Vec::new();
    while seen.len() < 2 {
        match tokio::time::timeout(WAIT, sub.recv()).await.expect("in time") {
            Some(TransportEvent::Lines(batch)) => seen.extend(batch.iter().cloned()),
            Some(TransportEvent::Stderr(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(numbers(&seen), vec![1, 2]);

    let status = handle.stop(StopMode::Graceful).await;
    assert_eq!(status.state, TransportState::Terminated);
    assert_eq!(status.exit.expect("exit").code, Some(0));
}

#[tokio::test]
async fn stderr_is_forwarded_separately() {
    let script = "read go; echo 'diagnostic line' >&2; printf '{\"n\":1}\\n'";
    let handle = ProcessHandle::start(&sh(script), fast_options()).expect("spawn");
    let mut sub = handle.subscribe().await.expect("subscribe");
    handle.send("go\n").await.expect("release script");

    let (lines, stderr, _) = drain(&mut sub).await;
    assert_eq!(numbers(&lines), vec![1]);
    assert_eq!(stderr, vec!["diagnostic line".to_owned()]);
}

#[tokio::test]
async fn output_written_before_exit_is_delivered_before_closed() {
    let script = "read go; i=1; while [ $i -le 500 ]; do printf '{\"n\":%d}\\n' $i; i=$((i+1)); done; exit 3";
    let handle = ProcessHandle::start(&sh(script), fast_options()).expect("spawn");
    let mut sub = handle.subscribe().await.expect("subscribe");
    handle.send("go\n").await.expect("release script");

    let (lines, _, closed) = drain(&mut sub).await;
    assert_eq!(lines.len(), 500);
    match closed {
        TransportEvent::Closed { reason, exit } => {
            assert_eq!(exit.expect("exit").code, Some(3));
            assert!(reason.contains('3'), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

// ── Stdin ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn json_written_to_stdin_reaches_the_agent() {
    let handle = ProcessHandle::start(&sh("exec cat"), fast_options()).expect("spawn");
    let mut sub = handle.subscribe().await.expect("subscribe");
    handle
        .send_json(&json!({"ping": 1}))
        .await
        .expect("write");

    match tokio::time::timeout(WAIT, sub.recv()).await.expect("echo in time") {
        Some(TransportEvent::Lines(batch)) => {
            assert_eq!(batch[0], InboundLine::Json(json!({"ping": 1})));
        }
        other => panic!("unexpected {other:?}"),
    }

    handle.stop(StopMode::Graceful).await;
    let err = handle.send("late\n").await.expect_err("stdin closed");
    assert!(matches!(err, AppError::TransportClosed(_)));
    assert!(handle.subscribe().await.is_err());
}

#[tokio::test]
#[serial_test::serial]
async fn environment_is_isolated_when_requested() {
    std::env::set_var("CONDUIT_PARENT_ONLY", "leak");
    let mut spec = sh("read go; printf '{\"own\":\"%s\",\"parent\":\"%s\"}\\n' \"$CONDUIT_OWN\" \"$CONDUIT_PARENT_ONLY\"")
        .env("CONDUIT_OWN", "set");
    spec.inherit_env = false;

    let handle = ProcessHandle::start(&spec, fast_options()).expect("spawn");
    let mut sub = handle.subscribe().await.expect("subscribe");
    handle.send("go\n").await.expect("release script");
    let (lines, _, _) = drain(&mut sub).await;
    assert_eq!(
        lines,
        vec![InboundLine::Json(json!({"own": "set", "parent": ""}))]
    );
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
#[serial_test::serial]
async fn graceful_stop_escalates_to_terminate() {
    // `sleep` ignores stdin close, so the stop must escalate to SIGTERM.
    let handle = ProcessHandle::start(&sh("exec sleep 30"), fast_options()).expect("spawn");
    let started = Instant::now();
    let status = handle.stop(StopMode::Graceful).await;

    assert_eq!(status.state, TransportState::Terminated);
    let exit = status.exit.expect("exit observed");
    assert_eq!(exit.code, None, "terminated by signal: {}", exit.reason);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[cfg(unix)]
#[tokio::test]
#[serial_test::serial]
async fn graceful_stop_kills_child_that_ignores_terminate() {
    let options = fast_options();
    let bound = options.close_grace
        + options.term_grace
        + options.kill_grace
        + options.drain_timeout
        + Duration::from_secs(1);
    let handle = ProcessHandle::start(
        &sh("trap '' TERM; while true; do sleep 0.05; done"),
        options,
    )
    .expect("spawn");
    // Let the shell install its trap before the stop begins.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let status = handle.stop(StopMode::Graceful).await;

    assert_eq!(status.state, TransportState::Terminated);
    let exit = status.exit.expect("exit observed");
    assert_eq!(exit.code, None);
    assert!(exit.reason.contains("signal: 9"), "{}", exit.reason);
    assert!(started.elapsed() < bound, "took {:?}", started.elapsed());
}

#[tokio::test]
#[serial_test::serial]
async fn immediate_stop_kills() {
    let handle = ProcessHandle::start(&sh("exec sleep 30"), fast_options()).expect("spawn");
    let started = Instant::now();
    let status = handle.stop(StopMode::Immediate).await;
    assert_eq!(status.state, TransportState::Terminated);
    assert!(started.elapsed() < Duration::from_secs(2));

    // Stopping again is harmless.
    let again = handle.stop(StopMode::Graceful).await;
    assert_eq!(again.state, TransportState::Terminated);
}

#[tokio::test]
#[serial_test::serial]
async fn idle_process_stops_itself() {
    let options = TransportOptions {
        idle_grace: Some(Duration::from_millis(200)),
        ..fast_options()
    };
    let handle = ProcessHandle::start(&sh("exec sleep 30"), options).expect("spawn");
    tokio::time::timeout(WAIT, handle.wait_terminated())
        .await
        .expect("idle auto-stop");
    assert_eq!(handle.state(), TransportState::Terminated);
}

#[tokio::test]
#[serial_test::serial]
async fn lease_keeps_idle_process_alive() {
    let options = TransportOptions {
        idle_grace: Some(Duration::from_millis(100)),
        ..fast_options()
    };
    let handle = ProcessHandle::start(&sh("exec sleep 30"), options).expect("spawn");
    let lease = handle.acquire().await.expect("lease");

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = handle.status().await;
    assert_eq!(status.state, TransportState::Running);
    assert_eq!(status.leases, 1);

    drop(lease);
    tokio::time::timeout(WAIT, handle.wait_terminated())
        .await
        .expect("stops once the lease is released");
}

// ── Lazy transport ────────────────────────────────────────────────────────────

#[tokio::test]
async fn transport_restarts_after_termination() {
    let transport = Transport::new(sh("exec cat"), fast_options());
    assert!(transport.current().await.is_none(), "nothing spawned yet");

    let first = transport.handle().await.expect("first handle");
    let same = transport.handle().await.expect("same handle");
    assert_eq!(first.id(), same.id());

    first.stop(StopMode::Immediate).await;
    let second = transport.handle().await.expect("restarted handle");
    assert_ne!(first.id(), second.id());
    assert_eq!(second.state(), TransportState::Running);

    let status = transport.stop(StopMode::Immediate).await.expect("stopped");
    assert_eq!(status.handle_id, second.id());
    assert!(transport.current().await.is_none());
}

#[tokio::test]
async fn missing_executable_is_a_spawn_error() {
    let spec = ProcessSpec::new("/nonexistent/agent-conduit-test-binary");
    let err = ProcessHandle::start(&spec, fast_options()).expect_err("spawn fails");
    assert!(matches!(err, AppError::Spawn(_)), "{err}");
}
