//! Block grid geometry and calibrator lock-on.
//!
//! # Calibrator
//! Block (0,0) is a black anchor.  Every other block of the top row and of
//! the left column carries one bit, drawn from one of two fixed two-color
//! calibrator palettes that alternate block by block (palette B on odd
//! indices, A on even), so adjacent calibrator blocks always differ by far
//! more than [`LOCK_ON_THRESHOLD`].  Blocks 1..=16 of each axis hold that
//! axis' block count LSB-first; block 17 and everything after it hold `false`.
//!
//! # Lock-on
//! [`lock_on`] learns the grid from pixels only.  Discovery walks the top row
//! and the left column pixel by pixel, counting color transitions into the
//! expected calibrator palette and decoding one bit per block.  A verification
//! pass then re-reads the calibrator at the derived pixel width.  When the
//! caller already knows the grid, discovery is skipped and verification alone
//! decides; a mismatch there is a configuration error, not a bad frame.

pub mod raster;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::palette::{color_distance, nearest, Rgb};
pub use raster::Raster;

/// Smallest grid edge, in blocks, that can carry the 17-block calibrator.
pub const MIN_BLOCKS: u16 = 17;
/// Width of the block-count field carried by the calibrator.
pub const CALIBRATOR_COUNT_BITS: usize = 16;
/// Color distance separating "same block" from "new block".
pub const LOCK_ON_THRESHOLD: f64 = 100.0;

pub const CALIBRATOR_A: [Rgb; 2] = [[0, 0, 0], [255, 255, 255]];
pub const CALIBRATOR_B: [Rgb; 2] = [[255, 0, 0], [0, 255, 255]];
const ANCHOR: Rgb = [0, 0, 0];

/// Relative disagreement tolerated between the two axis pixel widths.
const AXIS_TOLERANCE: f64 = 0.02;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Lock-on failed: {0}")]
    LockOnFailed(String),
    #[error("Geometry mismatch: expected {expected_h}x{expected_w} blocks, calibrator disagrees ({reason})")]
    GeometryMismatch { expected_h: u16, expected_w: u16, reason: String },
    #[error("Calibrator verification failed on {axis:?} axis: {reason}")]
    VerifyFailed { axis: Axis, reason: String },
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

// ── Grid ─────────────────────────────────────────────────────────────────────

/// Grid dimensions in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockGrid {
    pub block_height: u16,
    pub block_width:  u16,
}

impl BlockGrid {
    pub fn new(block_height: u16, block_width: u16) -> Result<Self, GeometryError> {
        if block_height < MIN_BLOCKS || block_width < MIN_BLOCKS {
            return Err(GeometryError::InvalidGeometry(format!(
                "{block_height}x{block_width} blocks is below the {MIN_BLOCKS}x{MIN_BLOCKS} minimum"
            )));
        }
        Ok(Self { block_height, block_width })
    }

    pub fn total_blocks(&self) -> usize {
        self.block_height as usize * self.block_width as usize
    }

    /// Blocks available to headers and payload.  Calibrator frames lose the
    /// top row and left column.
    pub fn content_blocks(&self, calibrator: bool) -> usize {
        if calibrator {
            (self.block_height as usize - 1) * (self.block_width as usize - 1)
        } else {
            self.total_blocks()
        }
    }

    /// Row-major content block coordinates `(row, col)`.
    pub fn positions(&self, calibrator: bool) -> BlockPositions {
        BlockPositions { grid: *self, calibrator, next: 0, total: self.content_blocks(calibrator) }
    }
}

/// Lazy row-major walk over a frame's content blocks.
#[derive(Debug, Clone)]
pub struct BlockPositions {
    grid:       BlockGrid,
    calibrator: bool,
    next:       usize,
    total:      usize,
}

impl Iterator for BlockPositions {
    type Item = (u16, u16);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let i = self.next;
        self.next += 1;
        let pos = if self.calibrator {
            let w = self.grid.block_width as usize - 1;
            (1 + i / w, 1 + i % w)
        } else {
            let w = self.grid.block_width as usize;
            (i / w, i % w)
        };
        Some((pos.0 as u16, pos.1 as u16))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.total - self.next;
        (n, Some(n))
    }
}

impl ExactSizeIterator for BlockPositions {}

/// Grid plus block edge length in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub grid:        BlockGrid,
    pub pixel_width: f64,
}

impl FrameGeometry {
    pub fn block_height(&self) -> u16 {
        self.grid.block_height
    }

    pub fn block_width(&self) -> u16 {
        self.grid.block_width
    }
}

// ── Calibrator rendering ─────────────────────────────────────────────────────

#[inline]
fn calibrator_palette(index: usize) -> &'static [Rgb; 2] {
    if index % 2 == 1 { &CALIBRATOR_B } else { &CALIBRATOR_A }
}

/// Bits carried by calibrator blocks `1..=len` of one axis.
pub fn calibrator_bits(count: u16, len: usize) -> Vec<bool> {
    (0..len)
        .map(|i| i < CALIBRATOR_COUNT_BITS && (count >> i) & 1 == 1)
        .collect()
}

fn decode_count(bits: &[bool]) -> u16 {
    bits.iter()
        .take(CALIBRATOR_COUNT_BITS)
        .enumerate()
        .fold(0u16, |acc, (i, &b)| acc | ((b as u16) << i))
}

/// Fill one block of a raster whose block edge is `pixel_width` pixels.
pub fn fill_block(raster: &mut Raster, row: u16, col: u16, pixel_width: u32, c: Rgb) {
    let x0 = col as u32 * pixel_width;
    let y0 = row as u32 * pixel_width;
    raster.fill_rect(x0, y0, x0 + pixel_width, y0 + pixel_width, c);
}

/// Draw the anchor and both calibrator axes.
pub fn render_calibrator(raster: &mut Raster, grid: BlockGrid, pixel_width: u32) {
    fill_block(raster, 0, 0, pixel_width, ANCHOR);
    let xs = calibrator_bits(grid.block_width, grid.block_width as usize - 1);
    for (i, bit) in xs.into_iter().enumerate() {
        let col = i + 1;
        fill_block(raster, 0, col as u16, pixel_width, calibrator_palette(col)[bit as usize]);
    }
    let ys = calibrator_bits(grid.block_height, grid.block_height as usize - 1);
    for (i, bit) in ys.into_iter().enumerate() {
        let row = i + 1;
        fill_block(raster, row as u16, 0, pixel_width, calibrator_palette(row)[bit as usize]);
    }
}

// ── Sampling ─────────────────────────────────────────────────────────────────

/// Average color of a block.  Blocks at least 5 px wide are sampled over
/// their central half; smaller blocks over their whole area.
pub fn scan_block(raster: &Raster, geometry: &FrameGeometry, row: u16, col: u16) -> Rgb {
    let pw = geometry.pixel_width;
    let inset = if pw >= 5.0 { pw / 4.0 } else { 0.0 };
    let x0 = col as f64 * pw + inset;
    let y0 = row as f64 * pw + inset;
    let x1 = (col as f64 + 1.0) * pw - inset;
    let y1 = (row as f64 + 1.0) * pw - inset;

    let max_x = raster.width().saturating_sub(1);
    let max_y = raster.height().saturating_sub(1);
    let xs = (x0.round() as u32).min(max_x);
    let ys = (y0.round() as u32).min(max_y);
    let xe = (x1.round() as u32).max(xs + 1);
    let ye = (y1.round() as u32).max(ys + 1);
    raster.mean(xs, ys, xe, ye)
}

// ── Lock-on ──────────────────────────────────────────────────────────────────

fn axis_pixel(raster: &Raster, axis: Axis, i: u32) -> Rgb {
    match axis {
        Axis::X => raster.pixel(i, 0),
        Axis::Y => raster.pixel(0, i),
    }
}

fn axis_len(raster: &Raster, axis: Axis) -> u32 {
    match axis {
        Axis::X => raster.width(),
        Axis::Y => raster.height(),
    }
}

/// Pixel creep along one axis; returns the decoded block count.
fn discover_axis(raster: &Raster, axis: Axis) -> Result<u16, GeometryError> {
    let len = axis_len(raster, axis);
    let mut prev = ANCHOR;
    let mut block = 0usize;
    let mut bits = Vec::with_capacity(CALIBRATOR_COUNT_BITS);

    for i in 1..len {
        let p = axis_pixel(raster, axis, i);
        if color_distance(p, prev) <= LOCK_ON_THRESHOLD {
            continue;
        }
        let (idx, snapped) = nearest(calibrator_palette(block + 1), p);
        if color_distance(p, snapped) >= LOCK_ON_THRESHOLD {
            // Transitional pixel; keep creeping.
            continue;
        }
        block += 1;
        prev = snapped;
        bits.push(idx == 1);
        if bits.len() == CALIBRATOR_COUNT_BITS {
            break;
        }
    }

    if bits.len() < CALIBRATOR_COUNT_BITS {
        return Err(GeometryError::LockOnFailed(format!(
            "{axis:?} axis: only {} calibrator block(s) found",
            bits.len()
        )));
    }
    let count = decode_count(&bits);
    if count < MIN_BLOCKS {
        return Err(GeometryError::LockOnFailed(format!(
            "{axis:?} axis: decoded block count {count} is below {MIN_BLOCKS}"
        )));
    }
    Ok(count)
}

fn verify_axis(raster: &Raster, geometry: &FrameGeometry, axis: Axis) -> Result<(), GeometryError> {
    let expected = match axis {
        Axis::X => geometry.block_width(),
        Axis::Y => geometry.block_height(),
    };
    let fail = |reason: String| GeometryError::VerifyFailed { axis, reason };

    let last = (CALIBRATOR_COUNT_BITS + 1).min(expected as usize - 1);
    let mut bits = Vec::with_capacity(last);
    for i in 1..=last {
        let c = match axis {
            Axis::X => scan_block(raster, geometry, 0, i as u16),
            Axis::Y => scan_block(raster, geometry, i as u16, 0),
        };
        let (idx, snapped) = nearest(calibrator_palette(i), c);
        if color_distance(c, snapped) >= LOCK_ON_THRESHOLD {
            return Err(fail(format!("block {i} does not match its calibrator palette")));
        }
        bits.push(idx == 1);
    }

    let decoded = decode_count(&bits);
    if decoded != expected {
        return Err(fail(format!("calibrator reads {decoded} blocks, expected {expected}")));
    }
    if bits.get(CALIBRATOR_COUNT_BITS).copied().unwrap_or(false) {
        return Err(fail("terminator bit is set".into()));
    }
    Ok(())
}

pub fn verify_blocks_x(raster: &Raster, geometry: &FrameGeometry) -> Result<(), GeometryError> {
    verify_axis(raster, geometry, Axis::X)
}

pub fn verify_blocks_y(raster: &Raster, geometry: &FrameGeometry) -> Result<(), GeometryError> {
    verify_axis(raster, geometry, Axis::Y)
}

/// Determine the frame geometry from pixel data.
///
/// With `known = Some(grid)`, the grid is trusted for the pixel-width
/// computation and then verified; disagreement is `GeometryMismatch`.
pub fn lock_on(raster: &Raster, known: Option<BlockGrid>) -> Result<FrameGeometry, GeometryError> {
    if raster.width() == 0 || raster.height() == 0 {
        return Err(GeometryError::LockOnFailed("empty frame".into()));
    }
    if color_distance(raster.pixel(0, 0), ANCHOR) > LOCK_ON_THRESHOLD {
        return Err(GeometryError::LockOnFailed("no black anchor at origin".into()));
    }

    let w = raster.width() as f64;
    let h = raster.height() as f64;

    if let Some(grid) = known {
        let pixel_width = (w / grid.block_width as f64 + h / grid.block_height as f64) / 2.0;
        let geometry = FrameGeometry { grid, pixel_width };
        let mismatch = |e: GeometryError| GeometryError::GeometryMismatch {
            expected_h: grid.block_height,
            expected_w: grid.block_width,
            reason:     e.to_string(),
        };
        verify_blocks_x(raster, &geometry).map_err(mismatch)?;
        verify_blocks_y(raster, &geometry).map_err(mismatch)?;
        return Ok(geometry);
    }

    let block_width = discover_axis(raster, Axis::X)?;
    let block_height = discover_axis(raster, Axis::Y)?;
    let px = w / block_width as f64;
    let py = h / block_height as f64;
    if (px - py).abs() / px.max(py) > AXIS_TOLERANCE {
        return Err(GeometryError::LockOnFailed(format!(
            "axis pixel widths disagree ({px:.3} vs {py:.3})"
        )));
    }

    let grid = BlockGrid::new(block_height, block_width)?;
    let geometry = FrameGeometry { grid, pixel_width: (px + py) / 2.0 };
    verify_blocks_x(raster, &geometry)?;
    verify_blocks_y(raster, &geometry)?;
    debug!(
        block_height,
        block_width,
        pixel_width = geometry.pixel_width,
        "locked on"
    );
    Ok(geometry)
}
