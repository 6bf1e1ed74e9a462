//! Wire frame codec for the terminal channel.
//!
//! Every transport message is one frame: a one-character type tag followed by
//! the payload. Outward payloads (server → client) are base64-wrapped so they
//! are safe inside a text-oriented transport; inward payloads (client →
//! server) are raw UTF-8, since input is user keystrokes or small JSON
//! control messages.
//!
//! Malformed frames are a decode error for the caller to drop and log — they
//! must never tear the session down.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::{AppError, Result};

/// One-character frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    /// Program output, server → client.
    Output,
    /// Terminal input or input echo.
    Input,
    /// Structured control message (`{Type, Info}` outward, free-form JSON inward).
    Control,
}

impl FrameTag {
    /// The wire character for this tag.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Output => 'O',
            Self::Input => 'I',
            Self::Control => 'C',
        }
    }

    /// Parse a wire character into a tag.
    #[must_use]
    pub const fn from_char(c: char) -> Option<Self> {
        match c {
            'O' => Some(Self::Output),
            'I' => Some(Self::Input),
            'C' => Some(Self::Control),
            _ => None,
        }
    }
}

/// Encode an outward frame: tag character + base64 of the UTF-8 payload.
#[must_use]
pub fn encode_outward(tag: FrameTag, payload: &str) -> String {
    let mut frame = String::with_capacity(1 + payload.len() * 4 / 3 + 4);
    frame.push(tag.as_char());
    BASE64.encode_string(payload.as_bytes(), &mut frame);
    frame
}

/// Encode a raw frame: tag character + payload verbatim.
///
/// Used for the cursor-erase echo markers, which the client consumes as
/// literal sequences rather than base64 text.
#[must_use]
pub fn encode_raw(tag: FrameTag, payload: &str) -> String {
    let mut frame = String::with_capacity(1 + payload.len());
    frame.push(tag.as_char());
    frame.push_str(payload);
    frame
}

/// Decode an inward frame into its tag and raw payload.
///
/// # Errors
///
/// Returns [`AppError::Frame`] when the message is empty or the leading
/// character is not a recognized tag.
pub fn decode(message: &str) -> Result<(FrameTag, &str)> {
    let mut chars = message.char_indices();
    let Some((_, first)) = chars.next() else {
        return Err(AppError::Frame("empty message".into()));
    };
    let Some(tag) = FrameTag::from_char(first) else {
        return Err(AppError::Frame(format!("unrecognized tag {first:?}")));
    };
    let rest = chars.next().map_or("", |(idx, _)| &message[idx..]);
    Ok((tag, rest))
}
