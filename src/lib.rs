pub mod bits;
pub mod palette;
pub mod geometry;
pub mod codec;
pub mod crypto;
pub mod header;
pub mod config;
pub mod writer;
pub mod scanner;
pub mod assembly;
pub mod media;
pub mod encoder;
pub mod decoder;

pub use bits::Bits;
pub use palette::{Palette, PaletteId, PaletteRegistry};
pub use geometry::{lock_on, BlockGrid, FrameGeometry, Raster};
pub use codec::{CodecId, get_codec};
pub use crypto::{CostParams, Credentials};
pub use header::{FrameHeader, InitializerHeader, Manifest, ManifestEntry, StreamHeader, StreamMetadata};
pub use config::{DecodeOptions, EncodeOptions, OutputMode};
pub use assembly::{StreamAssemblyState, StreamProgress};
pub use media::{FrameSink, FrameSource, MemoryFrames, PngDirectory};
pub use encoder::{encode_stream, encode_to_frames, EncodeReport};
pub use decoder::{AbortSignal, DecodeReport, DecodedStream, Decoder, FrameVerdict};
