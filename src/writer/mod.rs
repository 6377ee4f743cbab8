//! Frame planning and rendering.
//!
//! # Frame layout
//! A calibrator frame (every frame in image mode, frame 1 in video mode)
//! reserves its top row and left column, then carries the initializer, the
//! frame header and content, row-major from block (1,1).  Other frames carry
//! the frame header and content from block (0,0).  Headers always use the
//! one-bit setup palette, so each header bit occupies one block.
//!
//! # Content
//! Content is the setup-header stream (stream header, metadata header,
//! custom-palette header) followed by payload symbols.  Setup bits that do not
//! fit carry over into the next frame; payload only starts once every setup
//! bit has been placed.  The final frame's payload is zero-padded up to a
//! whole symbol.

use tracing::debug;

use crate::bits::Bits;
use crate::config::OutputMode;
use crate::geometry::{fill_block, render_calibrator, BlockGrid, GeometryError, Raster};
use crate::header::{FrameHeader, FRAME_HEADER_BITS, INITIALIZER_BITS};
use crate::palette::{setup_palette, Palette, Rgb};

// ── Layout ───────────────────────────────────────────────────────────────────

/// Per-frame capacity rules for one grid and output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub grid: BlockGrid,
    pub mode: OutputMode,
}

impl FrameLayout {
    pub fn new(grid: BlockGrid, mode: OutputMode) -> Self {
        Self { grid, mode }
    }

    pub fn has_calibrator(&self, frame_number: u32) -> bool {
        self.mode == OutputMode::Image || frame_number == 1
    }

    /// Blocks taken by the initializer and frame header.
    pub fn overhead_blocks(&self, frame_number: u32) -> usize {
        let init = if self.has_calibrator(frame_number) { INITIALIZER_BITS } else { 0 };
        init + FRAME_HEADER_BITS
    }

    /// Blocks left for content.
    pub fn capacity_blocks(&self, frame_number: u32) -> usize {
        self.grid
            .content_blocks(self.has_calibrator(frame_number))
            .saturating_sub(self.overhead_blocks(frame_number))
    }

    /// A calibrator frame must hold its headers plus at least one content block.
    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.capacity_blocks(1) == 0 {
            return Err(GeometryError::InvalidGeometry(format!(
                "{}x{} blocks cannot hold the {} header blocks of a calibrator frame",
                self.grid.block_height,
                self.grid.block_width,
                INITIALIZER_BITS + FRAME_HEADER_BITS
            )));
        }
        Ok(())
    }

    /// `(setup_bits, payload_bits)` placed in `frame_number`.
    fn allocate(&self, frame_number: u32, setup_left: usize, payload_left: usize, symbol_bits: usize) -> (usize, usize) {
        let cap = self.capacity_blocks(frame_number);
        let setup = setup_left.min(cap);
        let payload = if setup == setup_left {
            payload_left.min((cap - setup) * symbol_bits)
        } else {
            0
        };
        (setup, payload)
    }
}

/// Number of frames needed for the given content.
pub fn plan_frames(layout: &FrameLayout, setup_bits: usize, payload_bits: usize, symbol_bits: usize) -> u32 {
    let (mut setup_left, mut payload_left) = (setup_bits, payload_bits);
    let mut frame = 0u32;
    loop {
        frame += 1;
        let (s, p) = layout.allocate(frame, setup_left, payload_left, symbol_bits);
        setup_left -= s;
        payload_left -= p;
        if setup_left == 0 && payload_left == 0 {
            return frame;
        }
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

/// Colors for one frame, ready to rasterize.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub frame_number: u32,
    pub calibrator:   bool,
    /// One color per content block, in block order.
    pub colors:       Vec<Rgb>,
}

impl RenderJob {
    pub fn render(&self, grid: BlockGrid, pixel_width: u32) -> Raster {
        let mut raster = Raster::new(grid.block_width as u32 * pixel_width, grid.block_height as u32 * pixel_width);
        if self.calibrator {
            render_calibrator(&mut raster, grid, pixel_width);
        }
        for ((row, col), &c) in grid.positions(self.calibrator).zip(&self.colors) {
            fill_block(&mut raster, row, col, pixel_width, c);
        }
        raster
    }
}

/// Render a batch of jobs, in parallel when the feature is enabled.
pub fn render_all(jobs: &[RenderJob], grid: BlockGrid, pixel_width: u32) -> Vec<Raster> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        jobs.par_iter().map(|j| j.render(grid, pixel_width)).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        jobs.iter().map(|j| j.render(grid, pixel_width)).collect()
    }
}

fn push_symbols(out: &mut Vec<Rgb>, bits: &Bits, palette: &Palette) {
    let width = palette.bit_length() as usize;
    let mut cur = bits.cursor();
    while cur.remaining() > 0 {
        let take = width.min(cur.remaining());
        // A short tail is left-aligned into a full symbol.
        let v = cur.read_uint(take).unwrap_or(0) << (width - take);
        out.push(palette.encode(v as u32));
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Yields one [`RenderJob`] per frame of a stream.
pub struct FrameWriter<'p> {
    layout:       FrameLayout,
    setup_pal:    Palette,
    palette:      &'p Palette,
    initializer:  Bits,
    setup:        Bits,
    payload:      Bits,
    setup_pos:    usize,
    payload_pos:  usize,
    next_frame:   u32,
    total_frames: u32,
}

impl<'p> FrameWriter<'p> {
    /// `setup` is the concatenated stream, metadata and palette headers.
    pub fn new(layout: FrameLayout, palette: &'p Palette, initializer: Bits, setup: Bits, payload: Bits) -> Self {
        let total_frames = plan_frames(&layout, setup.len(), payload.len(), palette.bit_length() as usize);
        Self {
            layout,
            setup_pal: setup_palette(),
            palette,
            initializer,
            setup,
            payload,
            setup_pos: 0,
            payload_pos: 0,
            next_frame: 1,
            total_frames,
        }
    }

    pub fn total_frames(&self) -> u32 {
        self.total_frames
    }
}

impl Iterator for FrameWriter<'_> {
    type Item = RenderJob;

    fn next(&mut self) -> Option<RenderJob> {
        if self.next_frame > self.total_frames {
            return None;
        }
        let n = self.next_frame;
        self.next_frame += 1;

        let symbol_bits = self.palette.bit_length() as usize;
        let (s, p) = self.layout.allocate(
            n,
            self.setup.len() - self.setup_pos,
            self.payload.len() - self.payload_pos,
            symbol_bits,
        );
        let setup_part = self.setup.slice(self.setup_pos, self.setup_pos + s);
        let mut payload_part = self.payload.slice(self.payload_pos, self.payload_pos + p);
        self.setup_pos += s;
        self.payload_pos += p;
        payload_part.pad_zeros((symbol_bits - p % symbol_bits) % symbol_bits);

        let mut content = setup_part.clone();
        content.extend(&payload_part);
        let header = FrameHeader::new(n, (s + p) as u32, &content);

        let calibrator = self.layout.has_calibrator(n);
        let mut colors = Vec::with_capacity(self.layout.overhead_blocks(n) + s + payload_part.len() / symbol_bits);
        if calibrator {
            push_symbols(&mut colors, &self.initializer, &self.setup_pal);
        }
        push_symbols(&mut colors, &header.encode(), &self.setup_pal);
        push_symbols(&mut colors, &setup_part, &self.setup_pal);
        push_symbols(&mut colors, &payload_part, self.palette);

        debug!(frame = n, setup_bits = s, payload_bits = p, blocks = colors.len(), "planned frame");
        Some(RenderJob { frame_number: n, calibrator, colors })
    }
}
