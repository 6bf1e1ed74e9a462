//! Unit tests for the wire frame codec.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use webtty::frame::{decode, encode_outward, encode_raw, FrameTag};
use webtty::AppError;

/// An outward frame is the tag character followed by base64 of the payload.
#[test]
fn outward_frame_is_tag_plus_base64() {
    let frame = encode_outward(FrameTag::Output, "hello\r\n");

    assert!(frame.starts_with('O'), "output frames carry the O tag");
    let decoded = BASE64
        .decode(&frame[1..])
        .expect("payload must be valid base64");
    assert_eq!(decoded, b"hello\r\n");
}

/// A raw frame carries the payload verbatim after the tag.
#[test]
fn raw_frame_is_tag_plus_verbatim_payload() {
    let frame = encode_raw(FrameTag::Input, "CCAI");
    assert_eq!(frame, "ICCAI");
}

/// Decoding an inward frame returns the tag and the raw payload.
#[test]
fn decode_returns_tag_and_raw_payload() {
    let (tag, payload) = decode("Iabc").expect("valid frame must decode");
    assert_eq!(tag, FrameTag::Input);
    assert_eq!(payload, "abc");

    let (tag, payload) = decode("C{\"type\":\"conn\"}").expect("valid frame must decode");
    assert_eq!(tag, FrameTag::Control);
    assert_eq!(payload, "{\"type\":\"conn\"}");
}

/// A tag with no payload decodes to the empty payload.
#[test]
fn decode_accepts_empty_payload() {
    let (tag, payload) = decode("I").expect("bare tag must decode");
    assert_eq!(tag, FrameTag::Input);
    assert_eq!(payload, "");
}

/// An empty message is a frame error, not a panic.
#[test]
fn decode_rejects_empty_message() {
    match decode("") {
        Err(AppError::Frame(msg)) => {
            assert!(msg.contains("empty"), "error must mention emptiness, got: {msg}");
        }
        other => panic!("expected AppError::Frame, got {other:?}"),
    }
}

/// An unrecognized tag character is a frame error.
#[test]
fn decode_rejects_unknown_tag() {
    match decode("Xpayload") {
        Err(AppError::Frame(msg)) => {
            assert!(msg.contains('X'), "error must name the bad tag, got: {msg}");
        }
        other => panic!("expected AppError::Frame, got {other:?}"),
    }
}

/// Tag characters round-trip through their wire representation.
#[test]
fn tags_round_trip() {
    for tag in [FrameTag::Output, FrameTag::Input, FrameTag::Control] {
        assert_eq!(FrameTag::from_char(tag.as_char()), Some(tag));
    }
    assert_eq!(FrameTag::from_char('Z'), None);
}

/// Multibyte payloads survive the outward encoding.
#[test]
fn outward_frame_preserves_multibyte_payload() {
    let frame = encode_outward(FrameTag::Control, "运行结束");
    let decoded = BASE64.decode(&frame[1..]).expect("valid base64");
    assert_eq!(String::from_utf8_lossy(&decoded), "运行结束");
}
