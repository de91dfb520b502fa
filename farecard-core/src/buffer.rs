//! Immutable byte buffer with byte- and bit-level accessors, plus the
//! `BitWriter` used on the encode side.
//!
//! Bit numbering is MSB-first: bit 0 is the top bit of byte 0. Every accessor
//! checks its range and fails with `FareError::Bounds` instead of panicking.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::types::{hex_decode, hex_encode, FareError, Result};

/// Raw contents of one card record. Never mutated after construction.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        ByteBuffer { data }
    }

    pub fn zeroed(len: usize) -> Self {
        ByteBuffer { data: vec![0; len] }
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        hex_decode(hex)
            .map(ByteBuffer::new)
            .ok_or_else(|| FareError::InvalidHex(hex.to_string()))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bit_len(&self) -> usize {
        self.data.len() * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// True for unused log slots and blank sectors.
    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    fn check_bytes(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(FareError::Bounds {
                offset,
                len,
                limit: self.data.len(),
                unit: "bytes",
            }),
        }
    }

    /// Big-endian unsigned integer of `len` bytes (at most 8).
    pub fn int_at(&self, offset: usize, len: usize) -> Result<u64> {
        self.check_bytes(offset, len)?;
        if len > 8 {
            return Err(FareError::Bounds {
                offset,
                len,
                limit: 8,
                unit: "bytes",
            });
        }
        Ok(self.data[offset..offset + len]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }

    /// Little-endian unsigned integer of `len` bytes (at most 8).
    pub fn int_at_le(&self, offset: usize, len: usize) -> Result<u64> {
        self.check_bytes(offset, len)?;
        if len > 8 {
            return Err(FareError::Bounds {
                offset,
                len,
                limit: 8,
                unit: "bytes",
            });
        }
        Ok(self.data[offset..offset + len]
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }

    /// MSB-first unsigned integer of `bit_len` bits (at most 64) starting at `bit_offset`.
    /// The range may span byte boundaries.
    pub fn bits_at(&self, bit_offset: usize, bit_len: usize) -> Result<u64> {
        let out_of_range = FareError::Bounds {
            offset: bit_offset,
            len: bit_len,
            limit: self.bit_len(),
            unit: "bits",
        };
        if bit_len > 64 {
            return Err(out_of_range);
        }
        match bit_offset.checked_add(bit_len) {
            Some(end) if end <= self.bit_len() => {}
            _ => return Err(out_of_range),
        }

        let mut value = 0u64;
        let mut pos = bit_offset;
        let mut remaining = bit_len;
        while remaining > 0 {
            let byte = self.data[pos / 8];
            let used = pos % 8;
            let take = (8 - used).min(remaining);
            let chunk = (byte >> (8 - used - take)) & (((1u16 << take) - 1) as u8);
            value = (value << take) | chunk as u64;
            pos += take;
            remaining -= take;
        }
        Ok(value)
    }

    pub fn slice(&self, start: usize, len: usize) -> Result<ByteBuffer> {
        self.check_bytes(start, len)?;
        Ok(ByteBuffer::new(self.data[start..start + len].to_vec()))
    }

    pub fn hex(&self) -> String {
        hex_encode(&self.data)
    }

    pub fn equals_bytes(&self, other: &[u8]) -> bool {
        self.data == other
    }

    /// True when the buffer begins with `prefix`. Short buffers never match.
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.data.starts_with(prefix)
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(data: Vec<u8>) -> Self {
        ByteBuffer::new(data)
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(data: &[u8]) -> Self {
        ByteBuffer::new(data.to_vec())
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteBuffer({})", self.hex())
    }
}

impl Serialize for ByteBuffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

// ---------------------------------------------------------------------------
// BitWriter
// ---------------------------------------------------------------------------

/// MSB-first bit sink used by the schema encoder.
///
/// Starts either empty (zero-filled, growing as needed) or as a copy of an
/// existing buffer, in which case only the written bits change.
#[derive(Debug, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    pos: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        BitWriter::default()
    }

    pub fn over(base: &ByteBuffer) -> Self {
        BitWriter {
            data: base.as_bytes().to_vec(),
            pos: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Write the low `width` bits of `value`. Caller guarantees `width <= 64`
    /// and that `value` fits.
    pub fn write(&mut self, value: u64, width: u32) {
        let end = self.pos + width as usize;
        let needed = end.div_ceil(8);
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }
        for i in 0..width as usize {
            let bit = (value >> (width as usize - 1 - i)) & 1;
            let at = self.pos + i;
            let mask = 0x80u8 >> (at % 8);
            if bit == 1 {
                self.data[at / 8] |= mask;
            } else {
                self.data[at / 8] &= !mask;
            }
        }
        self.pos = end;
    }

    pub fn finish(self) -> ByteBuffer {
        ByteBuffer::new(self.data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
