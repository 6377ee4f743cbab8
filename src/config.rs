//! Encode/decode options.  Validation runs before any frame I/O.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Credentials;
use crate::geometry::{BlockGrid, GeometryError};
use crate::header::Manifest;
use crate::palette::{PaletteError, PaletteId, PaletteRegistry};
use crate::writer::FrameLayout;

/// Default number of frame-level failures tolerated per stream.
pub const DEFAULT_STRIKE_LIMIT: u32 = 10;
/// Frames decoded per parallel batch.
pub const DEFAULT_BATCH_SIZE: usize = 32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid geometry: {0}")]
    Geometry(#[from] GeometryError),
    #[error("Invalid palette: {0}")]
    Palette(#[from] PaletteError),
    #[error("Pixel width must be at least 1")]
    PixelWidth,
    #[error("The 24-bit palette cannot be used for video output")]
    Direct24Video,
    #[error("Metadata masking requires a password")]
    MaskingWithoutPassword,
    #[error("Batch size must be at least 1")]
    BatchSize,
}

/// How frames relate to each other on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum OutputMode {
    /// One continuous stream; only the first frame carries calibrator and initializer.
    Video,
    /// Independent images; every frame carries calibrator and initializer.
    Image,
}

// ── EncodeOptions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub palette:            PaletteId,
    pub grid:               BlockGrid,
    /// Block edge in output pixels.
    pub pixel_width:        u32,
    pub mode:               OutputMode,
    pub compression:        bool,
    pub compression_level:  i32,
    /// Encrypts the payload when set.
    pub credentials:        Option<Credentials>,
    /// Also encrypt the metadata header (names, manifest).
    pub mask_metadata:      bool,
    pub stream_name:        String,
    pub stream_description: String,
    pub manifest:           Manifest,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            palette:            PaletteId::Builtin(2),
            grid:               BlockGrid { block_height: 45, block_width: 80 },
            pixel_width:        8,
            mode:               OutputMode::Video,
            compression:        true,
            compression_level:  crate::codec::DEFAULT_COMPRESSION_LEVEL,
            credentials:        None,
            mask_metadata:      false,
            stream_name:        String::new(),
            stream_description: String::new(),
            manifest:           Manifest::default(),
        }
    }
}

impl EncodeOptions {
    pub fn validate(&self, registry: &PaletteRegistry) -> Result<(), ConfigError> {
        let grid = BlockGrid::new(self.grid.block_height, self.grid.block_width)?;
        FrameLayout::new(grid, self.mode).validate()?;
        if self.pixel_width == 0 {
            return Err(ConfigError::PixelWidth);
        }
        let palette = registry.get(self.palette)?;
        if palette.is_direct24() && self.mode == OutputMode::Video {
            return Err(ConfigError::Direct24Video);
        }
        if self.mask_metadata && self.credentials.is_none() {
            return Err(ConfigError::MaskingWithoutPassword);
        }
        Ok(())
    }
}

// ── DecodeOptions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub mode:              OutputMode,
    /// Frame-level failures tolerated before a stream is abandoned.
    pub strike_limit:      u32,
    /// Count a repeated frame as a strike.  Off by default: a later pass
    /// over the same frames must be able to fill gaps without tripping the
    /// limit.
    pub strike_duplicates: bool,
    /// Known grid; skips discovery and turns disagreement into an error.
    pub grid:              Option<BlockGrid>,
    pub credentials:       Option<Credentials>,
    pub parallel:          bool,
    pub batch_size:        usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            mode:              OutputMode::Video,
            strike_limit:      DEFAULT_STRIKE_LIMIT,
            strike_duplicates: false,
            grid:              None,
            credentials:       None,
            parallel:          true,
            batch_size:        DEFAULT_BATCH_SIZE,
        }
    }
}

impl DecodeOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(g) = self.grid {
            BlockGrid::new(g.block_height, g.block_width)?;
        }
        if self.batch_size == 0 {
            return Err(ConfigError::BatchSize);
        }
        Ok(())
    }
}
