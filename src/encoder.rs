//! Stream encoder: payload bytes in, frames out.
//!
//! Pipeline: compress (optional) → encrypt (optional) → hash the result as
//! the stream id → build the setup headers → plan frames → render → sink.

use thiserror::Error;
use tracing::{debug, info};

use crate::bits::Bits;
use crate::codec::{get_codec, CodecError, CodecId};
use crate::config::{ConfigError, EncodeOptions};
use crate::crypto::{self, CryptoError};
use crate::geometry::{BlockGrid, Raster};
use crate::header::metadata::encode_metadata;
use crate::header::palette::encode_palette_header;
use crate::header::{sha256, HeaderError, InitializerHeader, StreamHeader, StreamMetadata};
use crate::media::{FrameSink, MediaError};
use crate::palette::{PaletteError, PaletteId, PaletteRegistry};
use crate::writer::{plan_frames, render_all, FrameLayout, FrameWriter, RenderJob};

/// Frames rendered per parallel batch.
const RENDER_BATCH: usize = 16;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Invalid options: {0}")]
    Config(#[from] ConfigError),
    #[error("Palette error: {0}")]
    Palette(#[from] PaletteError),
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Frame output error: {0}")]
    Media(#[from] MediaError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeReport {
    pub stream_id:     [u8; 32],
    pub palette:       PaletteId,
    pub grid:          BlockGrid,
    pub total_frames:  u32,
    /// Caller's payload size.
    pub input_bytes:   u64,
    /// Size after compression and encryption.
    pub wire_bytes:    u64,
    pub setup_bits:    usize,
    pub compressed:    bool,
    pub encrypted:     bool,
}

impl EncodeReport {
    pub fn stream_id_hex(&self) -> String {
        hex::encode(self.stream_id)
    }

    pub fn summary(&self) -> String {
        format!(
            "stream {}: {} frame(s), {}x{} blocks, palette {}, {} → {} bytes{}{}",
            self.stream_id_hex(),
            self.total_frames,
            self.grid.block_height,
            self.grid.block_width,
            self.palette,
            self.input_bytes,
            self.wire_bytes,
            if self.compressed { ", compressed" } else { "" },
            if self.encrypted { ", encrypted" } else { "" },
        )
    }
}

/// Compress then encrypt, as the options ask.
pub fn preprocess(payload: &[u8], options: &EncodeOptions) -> Result<Vec<u8>, EncodeError> {
    let codec = get_codec(CodecId::from_flag(options.compression));
    let packed = codec.compress(payload, options.compression_level)?;
    match &options.credentials {
        Some(c) => Ok(crypto::encrypt(&packed, &c.password, &c.cost)?),
        None => Ok(packed),
    }
}

/// Encode `payload` into frames delivered to `sink`.
pub fn encode_stream(
    payload:  &[u8],
    options:  &EncodeOptions,
    registry: &PaletteRegistry,
    sink:     &mut dyn FrameSink,
) -> Result<EncodeReport, EncodeError> {
    options.validate(registry)?;
    let palette = registry.get(options.palette)?.clone();
    let layout = FrameLayout::new(options.grid, options.mode);

    let wire = preprocess(payload, options)?;
    let stream_id = sha256(&wire);
    let encrypted = options.credentials.is_some();
    let masking = encrypted && options.mask_metadata;

    let metadata = StreamMetadata::new(
        options.stream_name.clone(),
        options.stream_description.clone(),
        options.manifest.clone(),
    );
    let mask = if masking { options.credentials.as_ref() } else { None };
    let metadata_bytes = encode_metadata(&metadata, mask)?;
    let palette_bytes = if palette.is_custom() { encode_palette_header(&palette)? } else { Vec::new() };

    let mut stream_header = StreamHeader {
        size_bytes:            wire.len() as u64,
        total_frames:          0,
        compression:           options.compression,
        encryption:            encrypted,
        masking,
        metadata_len:          metadata_bytes.len() as u32,
        metadata_sha256:       sha256(&metadata_bytes),
        palette_header_len:    palette_bytes.len() as u16,
        palette_header_sha256: if palette_bytes.is_empty() { [0u8; 32] } else { sha256(&palette_bytes) },
    };
    let payload_bits = Bits::from_bytes(&wire);
    stream_header.total_frames = plan_frames(
        &layout,
        stream_header.setup_bits(),
        payload_bits.len(),
        palette.bit_length() as usize,
    );

    let mut setup = stream_header.encode()?;
    setup.push_bytes(&metadata_bytes);
    setup.push_bytes(&palette_bytes);
    let initializer = InitializerHeader::new(options.grid, palette.id, stream_id).encode();

    info!(
        stream = %hex::encode(stream_id),
        frames = stream_header.total_frames,
        input = payload.len(),
        wire = wire.len(),
        palette = %palette.id,
        codec = %CodecId::from_flag(options.compression),
        "encoding stream"
    );

    let writer = FrameWriter::new(layout, &palette, initializer, setup, payload_bits);
    debug_assert_eq!(writer.total_frames(), stream_header.total_frames);
    let mut batch = Vec::with_capacity(RENDER_BATCH);
    for job in writer {
        batch.push(job);
        if batch.len() == RENDER_BATCH {
            flush(&mut batch, options, sink)?;
        }
    }
    flush(&mut batch, options, sink)?;
    sink.finish()?;

    Ok(EncodeReport {
        stream_id,
        palette: palette.id,
        grid: options.grid,
        total_frames: stream_header.total_frames,
        input_bytes: payload.len() as u64,
        wire_bytes: wire.len() as u64,
        setup_bits: stream_header.setup_bits(),
        compressed: options.compression,
        encrypted,
    })
}

fn flush(
    batch:   &mut Vec<RenderJob>,
    options: &EncodeOptions,
    sink:    &mut dyn FrameSink,
) -> Result<(), MediaError> {
    if batch.is_empty() {
        return Ok(());
    }
    let rasters = render_all(batch, options.grid, options.pixel_width);
    for (job, raster) in batch.drain(..).zip(rasters) {
        debug!(frame = job.frame_number, "frame rendered");
        sink.accept(job.frame_number, raster)?;
    }
    Ok(())
}

/// Encode into memory.
pub fn encode_to_frames(
    payload:  &[u8],
    options:  &EncodeOptions,
    registry: &PaletteRegistry,
) -> Result<(Vec<Raster>, EncodeReport), EncodeError> {
    let mut frames: Vec<Raster> = Vec::new();
    let report = encode_stream(payload, options, registry, &mut frames)?;
    Ok((frames, report))
}
