use serde::{Deserialize, Serialize};

use super::{check_crc, seal, HeaderError, PROTOCOL_VERSION};
use crate::bits::Bits;
use crate::geometry::BlockGrid;
use crate::palette::{Palette, PaletteError, PaletteId, PaletteRegistry};

pub const INITIALIZER_BITS: usize = 580;

/// Leads every video stream and every image frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializerHeader {
    pub version:    u8,
    pub grid:       BlockGrid,
    pub palette_id: PaletteId,
    pub stream_id:  [u8; 32],
}

/// Outcome of resolving the initializer's palette against a registry.
#[derive(Debug, Clone, PartialEq)]
pub enum PaletteResolution {
    Known(Palette),
    /// Custom palette not known locally; a custom-palette header will follow.
    Pending,
}

impl InitializerHeader {
    pub fn new(grid: BlockGrid, palette_id: PaletteId, stream_id: [u8; 32]) -> Self {
        Self { version: PROTOCOL_VERSION, grid, palette_id, stream_id }
    }

    pub fn encode(&self) -> Bits {
        let mut bits = Bits::with_capacity(INITIALIZER_BITS);
        bits.push_uint(self.version as u64, 4);
        bits.push_uint(self.grid.block_height as u64, 16);
        bits.push_uint(self.grid.block_width as u64, 16);
        bits.push_bytes(&self.palette_id.to_field());
        bits.push_bytes(&self.stream_id);
        seal(bits)
    }

    pub fn decode(bits: &Bits) -> Result<Self, HeaderError> {
        check_crc(bits, INITIALIZER_BITS, HeaderError::InitializerCorrupt)?;
        let mut cur = bits.cursor();
        let version = cur.read_uint(4)? as u8;
        if version != PROTOCOL_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        let block_height = cur.read_uint(16)? as u16;
        let block_width = cur.read_uint(16)? as u16;
        let grid = BlockGrid::new(block_height, block_width)
            .map_err(|e| HeaderError::FieldRange(e.to_string()))?;
        let palette_id = PaletteId::from_field(cur.read_array::<32>()?);
        let stream_id = cur.read_array::<32>()?;
        Ok(Self { version, grid, palette_id, stream_id })
    }

    /// Unknown built-in ids are an error; unknown custom ids are `Pending`.
    pub fn resolve_palette(&self, registry: &PaletteRegistry) -> Result<PaletteResolution, PaletteError> {
        match registry.get(self.palette_id) {
            Ok(p) => Ok(PaletteResolution::Known(p.clone())),
            Err(PaletteError::NotFound(_)) => Ok(PaletteResolution::Pending),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InitializerHeader {
        InitializerHeader::new(BlockGrid::new(45, 80).unwrap(), PaletteId::Builtin(3), [7u8; 32])
    }

    #[test]
    fn layout_is_580_bits() {
        let bits = sample().encode();
        assert_eq!(bits.len(), INITIALIZER_BITS);
        assert_eq!(InitializerHeader::decode(&bits).unwrap(), sample());
    }

    #[test]
    fn corrupted_field_fails_crc_first() {
        let bits = sample().encode();
        let mut bad = bits.slice(0, 4);
        bad.push_uint(46, 16);
        bad.extend(&bits.slice(20, INITIALIZER_BITS));
        assert_eq!(InitializerHeader::decode(&bad), Err(HeaderError::InitializerCorrupt));
    }

    #[test]
    fn palette_resolution() {
        let reg = PaletteRegistry::with_builtins();
        assert!(matches!(sample().resolve_palette(&reg), Ok(PaletteResolution::Known(_))));

        let mut custom = sample();
        custom.palette_id = PaletteId::Custom([9u8; 32]);
        assert_eq!(custom.resolve_palette(&reg), Ok(PaletteResolution::Pending));

        let mut unknown = sample();
        unknown.palette_id = PaletteId::Builtin(200);
        assert_eq!(unknown.resolve_palette(&reg), Err(PaletteError::UnknownBuiltin(200)));
    }
}
