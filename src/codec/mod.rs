//! Compression service.
//!
//! The stream header carries a single compression flag, so the wire only
//! distinguishes "stored" from "compressed".  Compressed always means
//! Zstandard; the metadata and custom-palette headers are always compressed.
//!
//! Both directions are lossless and deterministic for a given level.

use std::fmt;

use thiserror::Error;

/// Default Zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Level used for the small setup headers.
pub const HEADER_COMPRESSION_LEVEL: i32 = 19;

// ── Codec selection ──────────────────────────────────────────────────────────

/// Which codec a stream's compression flag selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    /// Stored as-is.
    None,
    Zstd,
}

impl CodecId {
    #[inline]
    pub fn from_flag(compressed: bool) -> Self {
        if compressed { CodecId::Zstd } else { CodecId::None }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CodecId::None => "stored",
            CodecId::Zstd => "zstd",
        })
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("{codec} compression failed: {reason}")]
    Compression { codec: CodecId, reason: String },
    #[error("{codec} decompression failed: {reason}")]
    Decompression { codec: CodecId, reason: String },
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

// ── Implementations ──────────────────────────────────────────────────────────

pub struct NoneCodec;

impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId {
        CodecId::None
    }

    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId {
        CodecId::Zstd
    }

    /// Levels outside 1..=19 are clamped.
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level.clamp(1, 19)).map_err(|e| CodecError::Compression {
            codec:  CodecId::Zstd,
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression {
            codec:  CodecId::Zstd,
            reason: e.to_string(),
        })
    }
}

/// Codec for a stream's compression flag.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None => Box::new(NoneCodec),
        CodecId::Zstd => Box::new(ZstdCodec),
    }
}
