//! Unsigned LEB128 variable-length integers used by directory blocks.
//!
//! Both readers take a cursor `&mut &[u8]` and advance it exactly past the
//! consumed bytes.
use crate::error::{ErrorInner, Result};

const CONTINUATION: u8 = 0x80;

/// The maximum encoded size of a 32-bit value.
pub const MAX_VARUINT32_SIZE: usize = 5;

/// The maximum encoded size of a 64-bit value.
pub const MAX_VARUINT64_SIZE: usize = 10;

#[inline]
fn next_byte(cursor: &mut &[u8]) -> Result<u8> {
    let (&b, rest) = cursor.split_first().ok_or(ErrorInner::TruncatedVarint)?;
    *cursor = rest;
    Ok(b)
}

/// Read a varint of at most 32 significant bits.
///
/// The fifth byte contributes its low 4 bits. If it still has the
/// continuation bit set, all following continuation bytes are skipped up to
/// and including the terminating byte, so the cursor stays aligned with a
/// 64-bit reader. The returned value is the truncated accumulation in that
/// case.
pub fn read_varuint32(cursor: &mut &[u8]) -> Result<u32> {
    let mut result = 0u32;
    for i in 0..MAX_VARUINT32_SIZE - 1 {
        let b = next_byte(cursor)?;
        result |= u32::from(b & !CONTINUATION) << (7 * i);
        if b & CONTINUATION == 0 {
            return Ok(result);
        }
    }

    let mut b = next_byte(cursor)?;
    result |= u32::from(b) << 28;
    // Overflow.
    while b & CONTINUATION != 0 {
        b = next_byte(cursor)?;
    }
    Ok(result)
}

/// Read a varint of at most 64 significant bits.
///
/// At most 10 bytes are consumed. Only the lowest bit of the tenth byte is
/// used and its continuation bit is not inspected.
pub fn read_varuint64(cursor: &mut &[u8]) -> Result<u64> {
    let mut result = 0u64;
    for shift in (0..63).step_by(7) {
        let b = next_byte(cursor)?;
        result |= u64::from(b & !CONTINUATION) << shift;
        if b & CONTINUATION == 0 {
            return Ok(result);
        }
    }
    let b = next_byte(cursor)?;
    result |= u64::from(b) << 63;
    Ok(result)
}

/// Append `value` in the encoding read by [`read_varuint64`] and [`read_varuint32`].
#[cfg(feature = "serialize")]
pub fn write_varuint(out: &mut Vec<u8>, mut value: u64) {
    while value >= u64::from(CONTINUATION) {
        out.push(value as u8 | CONTINUATION);
        value >>= 7;
    }
    out.push(value as u8);
}
