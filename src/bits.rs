//! MSB-first bit buffer used by every header and frame on the wire.
//!
//! Headers are fixed-width bit layouts (not byte layouts), and frames carry
//! palette symbols of 1..=24 bits, so the protocol needs a buffer addressable
//! by bit.  [`Bits`] stores bits packed MSB-first into bytes; a zero-filled
//! tail byte holds the remainder.  [`BitCursor`] reads sequential fields.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitsError {
    #[error("Bit buffer exhausted: wanted {wanted} bit(s), {available} available")]
    Exhausted { wanted: usize, available: usize },
    #[error("Field width {0} exceeds 64 bits")]
    FieldTooWide(usize),
}

/// Growable, packed bit sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PackedBits")]
pub struct Bits {
    bytes: Vec<u8>,
    len:   usize,
}

/// Wire shape of [`Bits`], checked before it becomes one.
#[derive(Deserialize)]
struct PackedBits {
    bytes: Vec<u8>,
    len:   usize,
}

impl TryFrom<PackedBits> for Bits {
    type Error = String;

    fn try_from(raw: PackedBits) -> Result<Self, Self::Error> {
        if raw.bytes.len() != raw.len.div_ceil(8) {
            return Err(format!("{} bit(s) cannot be packed into {} byte(s)", raw.len, raw.bytes.len()));
        }
        let mut bits = Bits { bytes: raw.bytes, len: raw.len };
        bits.mask_tail();
        Ok(bits)
    }
}

impl Bits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bits: usize) -> Self {
        Self { bytes: Vec::with_capacity(bits.div_ceil(8)), len: 0 }
    }

    /// Wrap whole bytes; every bit of `bytes` becomes part of the sequence.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { bytes: bytes.to_vec(), len: bytes.len() * 8 }
    }

    /// Build from a slice of booleans (test and calibrator helper).
    pub fn from_bools(bools: &[bool]) -> Self {
        let mut out = Self::with_capacity(bools.len());
        for &b in bools {
            out.push(b);
        }
        out
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.len = 0;
    }

    #[inline]
    pub fn push(&mut self, bit: bool) {
        if self.len % 8 == 0 {
            self.bytes.push(0);
        }
        if bit {
            let idx = self.len / 8;
            self.bytes[idx] |= 0x80 >> (self.len % 8);
        }
        self.len += 1;
    }

    /// Append the low `width` bits of `value`, most significant first.
    pub fn push_uint(&mut self, value: u64, width: usize) {
        debug_assert!(width <= 64);
        for i in (0..width).rev() {
            self.push((value >> i) & 1 == 1);
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if self.len % 8 == 0 {
            self.bytes.extend_from_slice(bytes);
            self.len += bytes.len() * 8;
        } else {
            for &b in bytes {
                self.push_uint(b as u64, 8);
            }
        }
    }

    pub fn extend(&mut self, other: &Bits) {
        if self.len % 8 == 0 {
            self.bytes.extend_from_slice(&other.bytes);
            self.len += other.len;
        } else {
            for i in 0..other.len {
                self.push(other.get(i));
            }
        }
    }

    /// Append `count` zero bits.
    pub fn pad_zeros(&mut self, count: usize) {
        for _ in 0..count {
            self.push(false);
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        self.bytes[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Copy of bits `start..end`.
    pub fn slice(&self, start: usize, end: usize) -> Bits {
        let end = end.min(self.len);
        let start = start.min(end);
        if start % 8 == 0 {
            let mut out = Bits {
                bytes: self.bytes[start / 8..end.div_ceil(8)].to_vec(),
                len:   end - start,
            };
            out.mask_tail();
            return out;
        }
        let mut out = Bits::with_capacity(end - start);
        for i in start..end {
            out.push(self.get(i));
        }
        out
    }

    /// Drop everything past `len` bits.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        self.len = len;
        self.bytes.truncate(len.div_ceil(8));
        self.mask_tail();
    }

    /// Packed bytes; the final partial byte (if any) is zero-filled.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    pub fn cursor(&self) -> BitCursor<'_> {
        BitCursor { bits: self, pos: 0 }
    }

    fn mask_tail(&mut self) {
        let rem = self.len % 8;
        if rem != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= 0xFFu8 << (8 - rem);
            }
        }
    }
}

/// Sequential field reader over a [`Bits`] buffer.
#[derive(Debug, Clone)]
pub struct BitCursor<'a> {
    bits: &'a Bits,
    pos:  usize,
}

impl<'a> BitCursor<'a> {
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.bits.len() - self.pos
    }

    fn ensure(&self, wanted: usize) -> Result<(), BitsError> {
        if self.remaining() < wanted {
            return Err(BitsError::Exhausted { wanted, available: self.remaining() });
        }
        Ok(())
    }

    pub fn read_bool(&mut self) -> Result<bool, BitsError> {
        self.ensure(1)?;
        let b = self.bits.get(self.pos);
        self.pos += 1;
        Ok(b)
    }

    /// Read a `width`-bit unsigned field, MSB first.
    pub fn read_uint(&mut self, width: usize) -> Result<u64, BitsError> {
        if width > 64 {
            return Err(BitsError::FieldTooWide(width));
        }
        self.ensure(width)?;
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 1) | self.bits.get(self.pos) as u64;
            self.pos += 1;
        }
        Ok(value)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, BitsError> {
        self.ensure(count * 8)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_uint(8)? as u8);
        }
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], BitsError> {
        self.ensure(N * 8)?;
        let mut out = [0u8; N];
        for byte in out.iter_mut() {
            *byte = self.read_uint(8)? as u8;
        }
        Ok(out)
    }
}
