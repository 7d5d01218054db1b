//! Unit tests for the JSONL audit writer.
//!
//! Validates the per-thread daily layout, serialized field names, flushing
//! on disposition entries and appends across writer instances.

use std::path::Path;

use agent_conduit::audit::{AuditEntry, AuditEventType, AuditLogger, JsonlAuditWriter};
use serde_json::Value;

fn today() -> chrono::NaiveDate {
    chrono::Utc::now().date_naive()
}

fn read_lines(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .expect("audit file exists")
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid json line"))
        .collect()
}

fn entry(event_type: AuditEventType, thread: Option<&str>) -> AuditEntry {
    AuditEntry::new(event_type).with_turn(thread.map(str::to_owned), Some("turn".into()))
}

// ── File layout ───────────────────────────────────────────────────────────────

#[test]
fn writes_thread_file_under_dated_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_dir = dir.path().join("a").join("b");
    let writer = JsonlAuditWriter::new(log_dir.clone()).expect("writer");

    writer
        .log_entry(
            entry(AuditEventType::ApprovalApproved, Some("thr_1"))
                .with_request_id("srv-1".into())
                .with_method("item/commandExecution/requestApproval".into())
                .with_command(Some("cargo test".into()))
                .with_decision("accept_once".into()),
        )
        .expect("log");

    let path = writer.thread_log_path(today(), Some("thr_1"));
    assert_eq!(path, log_dir.join(today().to_string()).join("thr_1.jsonl"));
    let lines = read_lines(&path);
    assert_eq!(lines.len(), 1);
    let record = &lines[0];
    assert_eq!(record["event_type"], "approval_approved");
    assert_eq!(record["request_id"], "srv-1");
    assert_eq!(record["thread_id"], "thr_1");
    assert_eq!(record["command"], "cargo test");
    assert_eq!(record["decision"], "accept_once");
    assert!(record["reason"].is_null());
    assert!(record["timestamp"].as_str().is_some());
}

#[test]
fn threads_get_separate_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = JsonlAuditWriter::new(dir.path().to_path_buf()).expect("writer");

    writer
        .log_entry(entry(AuditEventType::ApprovalDenied, Some("thr_a")))
        .expect("a");
    writer
        .log_entry(entry(AuditEventType::ApprovalDenied, Some("thr_b")))
        .expect("b");
    writer
        .log_entry(entry(AuditEventType::ApprovalTimedOut, None))
        .expect("unscoped");

    for thread in [Some("thr_a"), Some("thr_b"), None] {
        let lines = read_lines(&writer.thread_log_path(today(), thread));
        assert_eq!(lines.len(), 1, "{thread:?}");
    }
    assert!(dir
        .path()
        .join(today().to_string())
        .join("unscoped.jsonl")
        .exists());
}

#[test]
fn hostile_thread_id_stays_inside_log_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = JsonlAuditWriter::new(dir.path().to_path_buf()).expect("writer");
    writer
        .log_entry(entry(AuditEventType::ApprovalDenied, Some("../escape")))
        .expect("log");

    let path = writer.thread_log_path(today(), Some("../escape"));
    assert!(path.starts_with(dir.path()));
    assert_eq!(read_lines(&path).len(), 1);
    assert!(!dir.path().join("escape.jsonl").exists());
}

// ── Flushing ──────────────────────────────────────────────────────────────────

#[test]
fn history_reaches_disk_with_the_disposition() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = JsonlAuditWriter::new(dir.path().to_path_buf()).expect("writer");
    let path = writer.thread_log_path(today(), Some("thr"));
    let types = [
        AuditEventType::ApprovalSubmitted,
        AuditEventType::ApprovalDeferred,
        AuditEventType::ApprovalTimedOut,
    ];

    writer
        .log_entry(entry(types[0].clone(), Some("thr")))
        .expect("submitted");
    writer
        .log_entry(entry(types[1].clone(), Some("thr")))
        .expect("deferred");
    let pending = std::fs::read_to_string(&path).unwrap_or_default();
    assert!(pending.is_empty(), "non-final entries stay buffered");

    writer
        .log_entry(entry(types[2].clone(), Some("thr")).with_reason("approval timed out".into()))
        .expect("timed out");
    let decoded: Vec<AuditEventType> = read_lines(&path)
        .into_iter()
        .map(|v| {
            serde_json::from_value::<AuditEntry>(v)
                .expect("entry")
                .event_type
        })
        .collect();
    assert_eq!(decoded, types);
}

#[test]
fn drop_flushes_buffered_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = {
        let writer = JsonlAuditWriter::new(dir.path().to_path_buf()).expect("writer");
        writer
            .log_entry(entry(AuditEventType::ApprovalSubmitted, Some("thr")))
            .expect("log");
        writer.thread_log_path(today(), Some("thr"))
    };
    assert_eq!(read_lines(&path).len(), 1);
}

#[test]
fn second_writer_appends_to_same_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    for _ in 0..2 {
        let writer = JsonlAuditWriter::new(dir.path().to_path_buf()).expect("writer");
        writer
            .log_entry(entry(AuditEventType::ApprovalApproved, Some("thr")))
            .expect("log");
    }
    let writer = JsonlAuditWriter::new(dir.path().to_path_buf()).expect("writer");
    assert_eq!(read_lines(&writer.thread_log_path(today(), Some("thr"))).len(), 2);
}

#[test]
fn disposition_types_are_flagged() {
    assert!(!AuditEventType::ApprovalSubmitted.is_disposition());
    assert!(!AuditEventType::ApprovalDeferred.is_disposition());
    assert!(AuditEventType::ApprovalApproved.is_disposition());
    assert!(AuditEventType::ApprovalDenied.is_disposition());
    assert!(AuditEventType::ApprovalTimedOut.is_disposition());
}
