//! Terminal input line assembly.
//!
//! The broker echoes keystrokes back to the client itself (local echo is
//! server-driven), so the buffer tracks both the FIFO of completed lines
//! consumed by the runner and the pending characters of the line still being
//! typed.

use std::collections::VecDeque;

/// Erase marker echoed for a single-width character backspace.
pub const ERASE_NARROW: &str = "CCAI";

/// Erase marker echoed for a double-width (CJK) character backspace.
pub const ERASE_WIDE: &str = "CCAICCAI";

/// `true` when `ch` renders as two terminal columns (Han ideograph range).
#[must_use]
pub const fn is_wide(ch: char) -> bool {
    matches!(ch, '\u{4e00}'..='\u{9fa5}')
}

/// FIFO of completed input lines plus the pending (unterminated) line.
#[derive(Debug, Default)]
pub struct InputBuffer {
    lines: VecDeque<String>,
    pending: Vec<char>,
}

impl InputBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append characters to the pending line.
    pub fn push_chars(&mut self, chars: &str) {
        self.pending.extend(chars.chars());
    }

    /// Remove the last pending character, returning it if one was present.
    pub fn backspace(&mut self) -> Option<char> {
        self.pending.pop()
    }

    /// Terminate the pending line, moving it onto the completed FIFO.
    pub fn flush_line(&mut self) {
        let line: String = self.pending.drain(..).collect();
        self.lines.push_back(line);
    }

    /// Pop the oldest completed line, if any.
    pub fn pop_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }

    /// Number of completed lines waiting to be consumed.
    #[must_use]
    pub fn completed_len(&self) -> usize {
        self.lines.len()
    }

    /// Drop everything, completed and pending.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.pending.clear();
    }
}
