//! Wire framing.
//!
//! A serialized message travels as the UTF-8 byte stream
//! `[[[<len>]<json>]]`, where `<len>` is the payload byte length written in
//! the wire alphabet (see [`crate::codec`]), at least 2 and at most 4
//! digits. The triple open makes accidental resynchronization on body bytes
//! unlikely without reserving any byte values in the payload itself.

mod deframer;

pub use deframer::Deframer;

use crate::codec;

pub(crate) const OPEN: u8 = b'[';
pub(crate) const CLOSE: u8 = b']';

/// Frame length digits: at least 2 so a bare `[[[x]` never parses, at most
/// 4 which bounds a frame at 16 MiB, far above any sane `max_message_size`.
pub(crate) const MIN_LEN_DIGITS: usize = 2;
pub(crate) const MAX_LEN_DIGITS: usize = 4;

/// Maximum message size a post office assumes until the broker announces
/// the real one in its connect reply.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 300;

/// Wrap a payload in a frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let prefix = codec::encode_padded(payload.len() as u64, MIN_LEN_DIGITS);
    let mut out = Vec::with_capacity(payload.len() + prefix.len() + 6);
    out.extend_from_slice(b"[[[");
    out.extend_from_slice(prefix.as_bytes());
    out.push(CLOSE);
    out.extend_from_slice(payload);
    out.extend_from_slice(b"]]");
    out
}
