//! The five setup/frame headers and their integrity checks.
//!
//! # Layouts (MSB-first)
//!
//! | Header | Bits | Fields |
//! |---|---|---|
//! | Initializer | 580 | version(4) block_height(16) block_width(16) palette_id(256) stream_id(256) crc32(32) |
//! | Frame | 352 | payload_bit_len(32) frame_number(32) frame_sha256(256) crc32(32) |
//! | Stream | 685 | size_bytes(64) total_frames(32) 3 flags metadata_len(32) metadata_sha256(256) palette_header_len(10) palette_header_sha256(256) crc32(32) |
//! | Metadata | var | zstd(JSON), optionally AES-GCM |
//! | Custom palette | var | zstd(JSON) |
//!
//! The three fixed headers end in a CRC32 over every preceding bit of the
//! same header (packed MSB-first, zero-filled final byte).  Decoding checks
//! the CRC before reading any field.  The variable headers are checked
//! against the SHA-256 the stream header declares for them.

pub mod frame;
pub mod initializer;
pub mod metadata;
pub mod palette;
pub mod stream;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::bits::{Bits, BitsError};

pub use frame::{FrameHeader, FRAME_HEADER_BITS};
pub use initializer::{InitializerHeader, PaletteResolution, INITIALIZER_BITS};
pub use metadata::{Manifest, ManifestEntry, MetadataOutcome, StreamMetadata};
pub use stream::{StreamHeader, STREAM_HEADER_BITS};

/// Protocol version carried in the initializer's 4-bit field.
pub const PROTOCOL_VERSION: u8 = 1;

const CRC_BITS: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Initializer header CRC32 mismatch")]
    InitializerCorrupt,
    #[error("Frame header CRC32 mismatch")]
    FrameHeaderCorrupt,
    #[error("Stream header CRC32 mismatch")]
    StreamHeaderCorrupt,
    #[error("Metadata header corrupt: {0}")]
    MetadataCorrupt(String),
    #[error("Custom palette header corrupt: {0}")]
    PaletteHeaderCorrupt(String),
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("Header field out of range: {0}")]
    FieldRange(String),
    #[error("Header encoding failed: {0}")]
    Encoding(String),
    #[error("Header truncated: {0}")]
    Truncated(#[from] BitsError),
}

/// CRC32 over a bit sequence.
pub fn crc32_bits(bits: &Bits) -> u32 {
    crc32fast::hash(bits.as_bytes())
}

/// Append the CRC32 of everything written so far.
pub(crate) fn seal(mut bits: Bits) -> Bits {
    let crc = crc32_bits(&bits);
    bits.push_uint(crc as u64, CRC_BITS);
    bits
}

/// Check the trailing CRC32 of a fixed-size header.
pub(crate) fn check_crc(bits: &Bits, total: usize, err: HeaderError) -> Result<(), HeaderError> {
    if bits.len() != total {
        return Err(HeaderError::Truncated(BitsError::Exhausted {
            wanted:    total,
            available: bits.len(),
        }));
    }
    let body = bits.slice(0, total - CRC_BITS);
    let stored = bits.slice(total - CRC_BITS, total).cursor().read_uint(CRC_BITS)? as u32;
    if crc32_bits(&body) != stored {
        return Err(err);
    }
    Ok(())
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_single_bit_flip_breaks_the_crc() {
        let mut body = Bits::new();
        body.push_uint(0xDEAD_BEEF_0123, 48);
        body.push_uint(0b1011, 4);
        let sealed = seal(body);
        let total = sealed.len();
        assert!(check_crc(&sealed, total, HeaderError::FrameHeaderCorrupt).is_ok());

        for i in 0..total {
            let mut flipped = Bits::new();
            for (j, b) in sealed.iter().enumerate() {
                flipped.push(if i == j { !b } else { b });
            }
            assert_eq!(
                check_crc(&flipped, total, HeaderError::FrameHeaderCorrupt),
                Err(HeaderError::FrameHeaderCorrupt),
                "flip at bit {i} went unnoticed"
            );
        }
    }
}
