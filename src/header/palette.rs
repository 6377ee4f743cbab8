//! Custom-palette header: teaches the reader a palette it has never seen.

use serde::{Deserialize, Serialize};

use super::stream::MAX_PALETTE_HEADER_BYTES;
use super::{sha256, HeaderError};
use crate::codec::{Codec, ZstdCodec, HEADER_COMPRESSION_LEVEL};
use crate::palette::{Palette, PaletteId, Rgb};

#[derive(Debug, Serialize, Deserialize)]
struct PaletteRecord {
    palette_id:  String,
    name:        String,
    description: String,
    created_at:  i64,
    color_count: u32,
    /// Packed RGB triples, hex encoded.
    colors:      String,
}

fn pack_colors(colors: &[Rgb]) -> String {
    hex::encode(colors.concat())
}

fn unpack_colors(s: &str) -> Option<Vec<Rgb>> {
    let raw = hex::decode(s).ok()?;
    if raw.len() % 3 != 0 {
        return None;
    }
    Some(raw.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

pub fn encode_palette_header(palette: &Palette) -> Result<Vec<u8>, HeaderError> {
    if !palette.is_custom() {
        return Err(HeaderError::Encoding(format!("palette {} is built in", palette.id)));
    }
    let record = PaletteRecord {
        palette_id:  palette.id.to_string(),
        name:        palette.name.clone(),
        description: palette.description.clone(),
        created_at:  palette.created_at,
        color_count: palette.map.color_count() as u32,
        colors:      pack_colors(palette.map.colors()),
    };
    let json = serde_json::to_vec(&record).map_err(|e| HeaderError::Encoding(e.to_string()))?;
    let packed = ZstdCodec
        .compress(&json, HEADER_COMPRESSION_LEVEL)
        .map_err(|e| HeaderError::Encoding(e.to_string()))?;
    if packed.len() > MAX_PALETTE_HEADER_BYTES {
        return Err(HeaderError::FieldRange(format!(
            "custom palette header compresses to {} bytes, limit {MAX_PALETTE_HEADER_BYTES}",
            packed.len()
        )));
    }
    Ok(packed)
}

/// Verify, decompress and rebuild the palette; its recomputed id must equal
/// the one the initializer declared.
pub fn decode_palette_header(
    bytes:         &[u8],
    declared_hash: &[u8; 32],
    expected:      PaletteId,
) -> Result<Palette, HeaderError> {
    let corrupt = |m: String| HeaderError::PaletteHeaderCorrupt(m);
    if &sha256(bytes) != declared_hash {
        return Err(corrupt("hash does not match stream header".into()));
    }
    let json = ZstdCodec.decompress(bytes).map_err(|e| corrupt(e.to_string()))?;
    let record: PaletteRecord = serde_json::from_slice(&json).map_err(|e| corrupt(e.to_string()))?;
    let colors = unpack_colors(&record.colors).ok_or_else(|| corrupt("malformed color list".into()))?;
    if record.color_count as usize != colors.len() {
        return Err(corrupt(format!(
            "declares {} colors, carries {}",
            record.color_count,
            colors.len()
        )));
    }
    let palette = Palette::custom(record.name, record.description, record.created_at, colors)
        .map_err(|e| corrupt(e.to_string()))?;
    if palette.id != expected || palette.id.to_string() != record.palette_id {
        return Err(corrupt(format!("rebuilt id {} does not match {expected}", palette.id)));
    }
    Ok(palette)
}
