use serde::{Deserialize, Serialize};

use super::{check_crc, seal, HeaderError};
use crate::bits::Bits;

pub const STREAM_HEADER_BITS: usize = 685;

/// Largest custom-palette header the 10-bit length field can describe.
pub const MAX_PALETTE_HEADER_BYTES: usize = (1 << 10) - 1;

/// First content of the stream; describes everything that follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    /// Pre-processed payload size in bytes.
    pub size_bytes:            u64,
    pub total_frames:          u32,
    pub compression:           bool,
    pub encryption:            bool,
    pub masking:               bool,
    pub metadata_len:          u32,
    pub metadata_sha256:       [u8; 32],
    /// Zero when no custom-palette header follows.
    pub palette_header_len:    u16,
    pub palette_header_sha256: [u8; 32],
}

impl StreamHeader {
    pub fn encode(&self) -> Result<Bits, HeaderError> {
        if self.palette_header_len as usize > MAX_PALETTE_HEADER_BYTES {
            return Err(HeaderError::FieldRange(format!(
                "custom palette header is {} bytes, limit {MAX_PALETTE_HEADER_BYTES}",
                self.palette_header_len
            )));
        }
        let mut bits = Bits::with_capacity(STREAM_HEADER_BITS);
        bits.push_uint(self.size_bytes, 64);
        bits.push_uint(self.total_frames as u64, 32);
        bits.push(self.compression);
        bits.push(self.encryption);
        bits.push(self.masking);
        bits.push_uint(self.metadata_len as u64, 32);
        bits.push_bytes(&self.metadata_sha256);
        bits.push_uint(self.palette_header_len as u64, 10);
        bits.push_bytes(&self.palette_header_sha256);
        Ok(seal(bits))
    }

    pub fn decode(bits: &Bits) -> Result<Self, HeaderError> {
        check_crc(bits, STREAM_HEADER_BITS, HeaderError::StreamHeaderCorrupt)?;
        let mut cur = bits.cursor();
        let h = Self {
            size_bytes:            cur.read_uint(64)?,
            total_frames:          cur.read_uint(32)? as u32,
            compression:           cur.read_bool()?,
            encryption:            cur.read_bool()?,
            masking:               cur.read_bool()?,
            metadata_len:          cur.read_uint(32)? as u32,
            metadata_sha256:       cur.read_array::<32>()?,
            palette_header_len:    cur.read_uint(10)? as u16,
            palette_header_sha256: cur.read_array::<32>()?,
        };
        if h.total_frames == 0 {
            return Err(HeaderError::FieldRange("stream declares zero frames".into()));
        }
        Ok(h)
    }

    /// Setup-header bits that follow this header in the content stream.
    pub fn trailing_setup_bits(&self) -> usize {
        (self.metadata_len as usize + self.palette_header_len as usize) * 8
    }

    /// All setup-header bits carried in the content stream.
    pub fn setup_bits(&self) -> usize {
        STREAM_HEADER_BITS + self.trailing_setup_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StreamHeader {
        StreamHeader {
            size_bytes:            123_456,
            total_frames:          20,
            compression:           true,
            encryption:            false,
            masking:               true,
            metadata_len:          77,
            metadata_sha256:       [1u8; 32],
            palette_header_len:    1023,
            palette_header_sha256: [2u8; 32],
        }
    }

    #[test]
    fn layout_is_685_bits() {
        let bits = sample().encode().unwrap();
        assert_eq!(bits.len(), STREAM_HEADER_BITS);
        assert_eq!(StreamHeader::decode(&bits).unwrap(), sample());
        assert_eq!(sample().setup_bits(), STREAM_HEADER_BITS + (77 + 1023) * 8);
    }

    #[test]
    fn oversized_palette_header_rejected() {
        let mut h = sample();
        h.palette_header_len = 1024;
        assert!(matches!(h.encode(), Err(HeaderError::FieldRange(_))));
    }

    #[test]
    fn flipped_flag_is_caught() {
        let bits = sample().encode().unwrap();
        let mut bad = bits.slice(0, 96);
        bad.push(!bits.get(96));
        bad.extend(&bits.slice(97, STREAM_HEADER_BITS));
        assert_eq!(StreamHeader::decode(&bad), Err(HeaderError::StreamHeaderCorrupt));
    }
}
