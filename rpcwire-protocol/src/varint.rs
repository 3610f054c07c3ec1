//! Base-128 variable-length unsigned integers.
//!
//! Each byte carries seven bits of the value, least significant group
//! first. The high bit is set on every byte except the last one.

use crate::error::ProtocolError;
use bytes::BufMut;

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Returns the number of bytes `encode` writes for `value`.
pub fn encoded_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Appends the shortest encoding of `value` to `buf`.
pub fn encode<B: BufMut>(mut value: u64, buf: &mut B) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decodes a varint from the front of `buf`.
///
/// Returns `Ok(Some((value, consumed)))` when a complete varint is present,
/// `Ok(None)` if `buf` ends in the middle of one, or
/// `Err(ProtocolError::InvalidLength)` if the encoding overflows 64 bits.
pub fn decode(buf: &[u8]) -> Result<Option<(u64, usize)>, ProtocolError> {
    let mut value = 0u64;
    let mut shift = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        // The tenth byte may only contribute the top bit.
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(ProtocolError::InvalidLength);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }

    Ok(None)
}
