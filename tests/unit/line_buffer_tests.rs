//! Unit tests for newline framing.
//!
//! Covers chunk boundaries that split lines (and multi-byte characters),
//! oversized-line recovery, and the stateless `feed` helper.

use agent_conduit::wire::line_buffer::{feed, LineBuffer};
use agent_conduit::AppError;

fn ok_lines(items: Vec<agent_conduit::Result<String>>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.expect("line should decode"))
        .collect()
}

// ── Chunk boundaries ──────────────────────────────────────────────────────────

#[test]
fn lines_reassembled_across_chunks() {
    let mut buf = LineBuffer::new(1024);
    assert!(buf.feed(b"{\"a\":").is_empty());
    assert_eq!(buf.pending_bytes(), 5);

    let lines = ok_lines(buf.feed(b"1}\n{\"b\":2}\n{\"c\""));
    assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);

    let lines = ok_lines(buf.feed(b":3}\r\n"));
    assert_eq!(lines, vec!["{\"c\":3}"]);
    assert_eq!(buf.pending_bytes(), 0);
}

#[test]
fn multibyte_character_split_between_chunks() {
    let text = "{\"t\":\"héllo\"}\n".as_bytes();
    let split = text.iter().position(|&b| b == 0xC3).expect("é lead byte") + 1;
    let mut buf = LineBuffer::new(1024);
    assert!(buf.feed(&text[..split]).is_empty());
    assert_eq!(ok_lines(buf.feed(&text[split..])), vec!["{\"t\":\"héllo\"}"]);
}

#[test]
fn unterminated_tail_flushed_on_finish() {
    let mut buf = LineBuffer::default();
    assert!(buf.feed(b"{\"last\":true}").is_empty());
    let tail = buf.finish().expect("tail").expect("valid line");
    assert_eq!(tail, "{\"last\":true}");
    assert!(buf.finish().is_none());
}

// ── Bounds ────────────────────────────────────────────────────────────────────

#[test]
fn oversized_line_reported_once_then_stream_recovers() {
    let mut buf = LineBuffer::new(8);
    let first = buf.feed(b"0123456789");
    assert_eq!(first.len(), 1);
    assert!(matches!(first[0], Err(AppError::Decode(_))));

    // Rest of the oversized line is discarded without a second report.
    let rest = ok_lines(buf.feed(b"abc\n{}\n"));
    assert_eq!(rest, vec!["{}"]);
}

#[test]
fn invalid_utf8_is_a_decode_error() {
    let mut buf = LineBuffer::new(64);
    let items = buf.feed(&[0xFF, 0xFE, b'\n']);
    assert!(matches!(items.as_slice(), [Err(AppError::Decode(_))]));
}

// ── Stateless helper ──────────────────────────────────────────────────────────

#[test]
fn stateless_feed_returns_remainder() {
    let (lines, rest) = feed(b"{\"a\"", b":1}\n{\"b\"", 1024).expect("feed");
    assert_eq!(lines, vec!["{\"a\":1}"]);
    assert_eq!(rest, b"{\"b\"");
}

#[test]
fn stateless_feed_rejects_oversized_remainder() {
    let err = feed(b"", b"0123456789", 4).expect_err("too long");
    assert!(matches!(err, AppError::Decode(_)));
}

// ── Chunking independence ─────────────────────────────────────────────────────

fn sample_stream(lines: usize) -> (Vec<u8>, Vec<String>) {
    let expected: Vec<String> = (0..lines)
        .map(|i| format!("{{\"n\":{i},\"text\":\"line-{i}-ü\"}}"))
        .collect();
    let mut bytes = Vec::new();
    for line in &expected {
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
    }
    // Unterminated tail, flushed at end of input.
    bytes.extend_from_slice(b"{\"tail\":true}");
    (bytes, expected)
}

fn decode_in_chunks(bytes: &[u8], cuts: &[usize]) -> Vec<String> {
    let mut buf = LineBuffer::new(4096);
    let mut lines = Vec::new();
    let mut start = 0;
    for &cut in cuts.iter().chain(std::iter::once(&bytes.len())) {
        lines.extend(ok_lines(buf.feed(&bytes[start..cut])));
        start = cut;
    }
    if let Some(tail) = buf.finish() {
        lines.push(tail.expect("tail decodes"));
    }
    lines
}

#[test]
fn byte_by_byte_matches_single_chunk() {
    let (bytes, mut expected) = sample_stream(20);
    expected.push("{\"tail\":true}".into());

    let whole = decode_in_chunks(&bytes, &[]);
    let cuts: Vec<usize> = (1..bytes.len()).collect();
    let byte_by_byte = decode_in_chunks(&bytes, &cuts);

    assert_eq!(whole, expected);
    assert_eq!(byte_by_byte, whole);
}

#[test]
fn fifty_lines_across_three_uneven_chunks() {
    let (bytes, expected) = sample_stream(50);
    let terminated = bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .expect("newline")
        + 1;
    let bytes = &bytes[..terminated];

    // Cuts land mid-line: 7 bytes in, then well past the middle.
    let first = 7;
    let second = bytes.len() * 2 / 3 + 3;
    assert_ne!(bytes[first - 1], b'\n');
    assert_ne!(bytes[second - 1], b'\n');

    let lines = decode_in_chunks(bytes, &[first, second]);
    assert_eq!(lines.len(), 50);
    assert_eq!(lines, expected);
    for line in &lines {
        serde_json::from_str::<serde_json::Value>(line).expect("well-formed json");
    }

    // The stateless helper agrees when the caller carries the remainder.
    let mut remainder = Vec::new();
    let mut stateless = Vec::new();
    for chunk in [&bytes[..first], &bytes[first..second], &bytes[second..]] {
        let (lines, rest) = feed(&remainder, chunk, 4096).expect("within limit");
        stateless.extend(lines);
        remainder = rest;
    }
    assert!(remainder.is_empty());
    assert_eq!(stateless, expected);
}
