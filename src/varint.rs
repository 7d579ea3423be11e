use crate::error::CodecError;
use bytes::{Buf, BufMut};

/// Largest value representable by a variable-length integer.
pub const MAX_VALUE: u64 = (1 << 62) - 1;

pub(crate) fn ensure_remaining<B: Buf>(buf: &B, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::UnexpectedEnd {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Reads one variable-length integer and advances `buf` past it.
///
/// The two high bits of the first byte select the total length (1, 2, 4 or 8
/// bytes), the remaining six bits are the most significant bits of the value.
/// Non-canonical encodings are accepted.
pub fn read<B: Buf>(buf: &mut B) -> Result<u64, CodecError> {
    ensure_remaining(buf, 1)?;
    let mut first = buf.get_u8();

    let mut class = 0;
    if first & 0x40 != 0 {
        class += 1;
        first -= 0x40;
    }
    if first & 0x80 != 0 {
        class += 2;
        first -= 0x80;
    }

    let len = 1usize << class;
    ensure_remaining(buf, len - 1)?;

    let mut value = u64::from(first);
    for _ in 1..len {
        value = (value << 8) + u64::from(buf.get_u8());
    }
    Ok(value)
}

/// Number of bytes the shortest encoding of `value` takes.
pub fn encoded_len(value: u64) -> Result<usize, CodecError> {
    match value {
        0..=0x3f => Ok(1),
        0x40..=0x3fff => Ok(2),
        0x4000..=0x3fff_ffff => Ok(4),
        0x4000_0000..=MAX_VALUE => Ok(8),
        _ => Err(CodecError::ValueTooLarge(value)),
    }
}

/// Writes `value` using its shortest encoding and returns the number of bytes written.
pub fn write<B: BufMut>(value: u64, buf: &mut B) -> Result<usize, CodecError> {
    let len = encoded_len(value)?;
    match len {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
    Ok(len)
}
