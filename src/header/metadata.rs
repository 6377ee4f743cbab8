//! Metadata header: stream description plus the file/directory manifest.
//!
//! Wire form: `zstd(JSON)`, then AES-GCM when both encryption and masking are
//! on.  The stream header declares the SHA-256 of the transmitted bytes, so
//! integrity can be checked before (and without) the password.

use serde::{Deserialize, Serialize};

use super::{sha256, HeaderError};
use crate::codec::{Codec, ZstdCodec, HEADER_COMPRESSION_LEVEL};
use crate::crypto::{self, Credentials};

/// One node of the manifest.  Directories carry children and no hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name:     String,
    pub size:     u64,
    /// Hex SHA-256 of the file contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256:   Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ManifestEntry>,
}

impl ManifestEntry {
    pub fn file(name: impl Into<String>, data: &[u8]) -> Self {
        Self {
            name:     name.into(),
            size:     data.len() as u64,
            sha256:   Some(hex::encode(sha256(data))),
            children: Vec::new(),
        }
    }

    pub fn directory(name: impl Into<String>, children: Vec<ManifestEntry>) -> Self {
        let size = children.iter().map(|c| c.size).sum();
        Self { name: name.into(), size, sha256: None, children }
    }

    pub fn is_directory(&self) -> bool {
        self.sha256.is_none()
    }
}

/// Layout used to re-materialize files from the flat payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn single_file(name: impl Into<String>, data: &[u8]) -> Self {
        Self { entries: vec![ManifestEntry::file(name, data)] }
    }

    pub fn file_count(&self) -> usize {
        fn count(e: &ManifestEntry) -> usize {
            if e.is_directory() { e.children.iter().map(count).sum() } else { 1 }
        }
        self.entries.iter().map(count).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub program_version:    String,
    pub stream_name:        String,
    pub stream_description: String,
    /// Unix seconds.
    pub created_at:         i64,
    pub manifest:           Manifest,
}

impl StreamMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>, manifest: Manifest) -> Self {
        Self {
            program_version:    env!("CARGO_PKG_VERSION").to_owned(),
            stream_name:        name.into(),
            stream_description: description.into(),
            created_at:         chrono::Utc::now().timestamp(),
            manifest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataOutcome {
    Decoded(StreamMetadata),
    /// Header bytes intact but masked, and no password was supplied.
    PendingDecryption,
}

/// Serialize, compress and (when `mask` is given) encrypt the metadata.
pub fn encode_metadata(meta: &StreamMetadata, mask: Option<&Credentials>) -> Result<Vec<u8>, HeaderError> {
    let json = serde_json::to_vec(meta).map_err(|e| HeaderError::Encoding(e.to_string()))?;
    let packed = ZstdCodec
        .compress(&json, HEADER_COMPRESSION_LEVEL)
        .map_err(|e| HeaderError::Encoding(e.to_string()))?;
    match mask {
        Some(c) => crypto::encrypt(&packed, &c.password, &c.cost)
            .map_err(|e| HeaderError::Encoding(e.to_string())),
        None => Ok(packed),
    }
}

/// Verify and open the metadata header.
pub fn decode_metadata(
    bytes:         &[u8],
    declared_hash: &[u8; 32],
    masked:        bool,
    credentials:   Option<&Credentials>,
) -> Result<MetadataOutcome, HeaderError> {
    if &sha256(bytes) != declared_hash {
        return Err(HeaderError::MetadataCorrupt("hash does not match stream header".into()));
    }
    let packed = if masked {
        let Some(c) = credentials else {
            return Ok(MetadataOutcome::PendingDecryption);
        };
        crypto::decrypt(bytes, &c.password, &c.cost)
            .ok_or_else(|| HeaderError::MetadataCorrupt("decryption failed (wrong password?)".into()))?
    } else {
        bytes.to_vec()
    };
    let json = ZstdCodec
        .decompress(&packed)
        .map_err(|e| HeaderError::MetadataCorrupt(e.to_string()))?;
    let meta = serde_json::from_slice(&json).map_err(|e| HeaderError::MetadataCorrupt(e.to_string()))?;
    Ok(MetadataOutcome::Decoded(meta))
}
