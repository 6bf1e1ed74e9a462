//! Unit tests for input line assembly and width classification.

use webtty::session::input::{is_wide, InputBuffer, ERASE_NARROW, ERASE_WIDE};

/// Submitting `a`, `b`, backspace, `c`, newline yields exactly one completed
/// line `"ac"`, with no characters lost or duplicated.
#[test]
fn line_assembly_with_backspace() {
    let mut buf = InputBuffer::new();

    buf.push_chars("a");
    buf.push_chars("b");
    assert_eq!(buf.backspace(), Some('b'));
    buf.push_chars("c");
    buf.flush_line();

    assert_eq!(buf.pop_line().as_deref(), Some("ac"));
    assert_eq!(buf.pop_line(), None, "exactly one line must be produced");
}

/// Completed lines come out in FIFO order.
#[test]
fn completed_lines_are_fifo() {
    let mut buf = InputBuffer::new();
    buf.push_chars("first");
    buf.flush_line();
    buf.push_chars("second");
    buf.flush_line();

    assert_eq!(buf.completed_len(), 2);
    assert_eq!(buf.pop_line().as_deref(), Some("first"));
    assert_eq!(buf.pop_line().as_deref(), Some("second"));
}

/// Backspace on an empty pending line removes nothing.
#[test]
fn backspace_on_empty_pending_is_none() {
    let mut buf = InputBuffer::new();
    assert_eq!(buf.backspace(), None);
}

/// Flushing with no pending characters still produces an (empty) line —
/// pressing enter on an empty prompt sends an empty line to the program.
#[test]
fn flush_empty_pending_produces_empty_line() {
    let mut buf = InputBuffer::new();
    buf.flush_line();
    assert_eq!(buf.pop_line().as_deref(), Some(""));
}

/// A pasted multi-character chunk is buffered character by character.
#[test]
fn multi_char_chunk_is_buffered() {
    let mut buf = InputBuffer::new();
    buf.push_chars("abc");
    assert_eq!(buf.backspace(), Some('c'));
    buf.flush_line();
    assert_eq!(buf.pop_line().as_deref(), Some("ab"));
}

/// `clear` drops completed and pending input alike.
#[test]
fn clear_drops_everything() {
    let mut buf = InputBuffer::new();
    buf.push_chars("line");
    buf.flush_line();
    buf.push_chars("partial");
    buf.clear();

    assert_eq!(buf.completed_len(), 0);
    assert_eq!(buf.backspace(), None);
}

/// Han ideographs are double-width; ASCII and kana-range boundaries are not.
#[test]
fn width_classification() {
    assert!(is_wide('中'));
    assert!(is_wide('\u{4e00}'));
    assert!(is_wide('\u{9fa5}'));
    assert!(!is_wide('a'));
    assert!(!is_wide('\u{4dff}'));
    assert!(!is_wide('\u{9fa6}'));
}

/// The wide erase marker is the narrow marker doubled.
#[test]
fn erase_markers() {
    assert_eq!(ERASE_NARROW, "CCAI");
    assert_eq!(ERASE_WIDE, "CCAICCAI");
}
