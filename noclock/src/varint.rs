//! LEB128 varints, used to store edge times as deltas.

use std::{io, slice};

/// Maximum encoded length of a u64 (10 bytes with 7 bits each).
pub const MAX_VARINT_BYTES: usize = 10;

/// Decode an unsigned varint from the start of `input`. Returns the value and
/// the number of bytes it occupied, or None if it overflows a u64 or the input
/// ends before the last byte.
pub fn decode_varint(input: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, byte) in input.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        let bits = (byte & 0x7F) as u64;
        // Bits that would be shifted out of the top of the u64.
        if shift > 0 && bits >> (64 - shift) != 0 {
            return None;
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Append an unsigned varint to `output`. Returns the number of bytes written.
pub fn encode_varint(output: &mut Vec<u8>, mut value: u64) -> usize {
    for i in 0..MAX_VARINT_BYTES {
        let mut bits = value as u8 & 0x7F;
        value >>= 7;
        let more = value != 0;
        if more {
            bits |= 0x80;
        }
        output.push(bits);
        if !more {
            return i + 1;
        }
    }
    MAX_VARINT_BYTES
}

pub trait VarintReader {
    fn read_varint(&mut self) -> io::Result<u64>;
}

impl<R> VarintReader for R
where
    R: io::Read,
{
    fn read_varint(&mut self) -> io::Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let mut byte = 0;
            self.read_exact(slice::from_mut(&mut byte))?;

            if shift >= 64 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflow"));
            }
            let bits = (byte & 0x7F) as u64;
            if shift > 0 && bits >> (64 - shift) != 0 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflow"));
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}

pub trait VarintWriter {
    fn write_varint(&mut self, value: u64) -> io::Result<()>;
}

impl<W> VarintWriter for W
where
    W: io::Write,
{
    fn write_varint(&mut self, value: u64) -> io::Result<()> {
        let mut buf = Vec::with_capacity(MAX_VARINT_BYTES);
        encode_varint(&mut buf, value);
        self.write_all(&buf)
    }
}
