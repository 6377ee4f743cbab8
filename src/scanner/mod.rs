//! Frame scanner: turns a locked-on raster back into bits.
//!
//! Blocks are consumed lazily in the same row-major order the writer uses.
//! A read of `n` bits takes `ceil(n / bit_length)` blocks; surplus bits of the
//! last block are kept as leftover and served first by the next read.  A read
//! that runs out of blocks returns what it found and is flagged incomplete.

use crate::bits::Bits;
use crate::geometry::{scan_block, BlockPositions, FrameGeometry, Raster};
use crate::palette::Palette;

/// Result of one [`FrameScanner::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRead {
    pub bits:     Bits,
    /// False when the frame ran out of blocks before `n` bits were read.
    pub complete: bool,
}

pub struct FrameScanner<'r> {
    raster:    &'r Raster,
    geometry:  FrameGeometry,
    positions: BlockPositions,
    leftover:  Bits,
}

impl<'r> FrameScanner<'r> {
    pub fn new(raster: &'r Raster, geometry: FrameGeometry, calibrator: bool) -> Self {
        Self {
            raster,
            geometry,
            positions: geometry.grid.positions(calibrator),
            leftover: Bits::new(),
        }
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    /// Content blocks not yet consumed.
    pub fn remaining_blocks(&self) -> usize {
        self.positions.len()
    }

    pub fn leftover_bits(&self) -> usize {
        self.leftover.len()
    }

    /// Read `n` bits, decoding blocks with `palette`.
    pub fn read(&mut self, n: usize, palette: &Palette) -> ScanRead {
        let mut out = Bits::with_capacity(n);
        let from_leftover = n.min(self.leftover.len());
        if from_leftover > 0 {
            out.extend(&self.leftover.slice(0, from_leftover));
            self.leftover = self.leftover.slice(from_leftover, self.leftover.len());
        }

        let need = n - from_leftover;
        if need == 0 {
            return ScanRead { bits: out, complete: true };
        }

        let width = palette.bit_length() as usize;
        let blocks = need.div_ceil(width);
        let complete = blocks <= self.positions.len();
        let mut decoded = Bits::with_capacity(blocks * width);
        for (row, col) in self.positions.by_ref().take(blocks) {
            let observed = scan_block(self.raster, &self.geometry, row, col);
            decoded.push_uint(palette.decode(observed) as u64, width);
        }

        if complete {
            out.extend(&decoded.slice(0, need));
            self.leftover.extend(&decoded.slice(need, decoded.len()));
        } else {
            out.extend(&decoded);
        }
        ScanRead { bits: out, complete }
    }

    /// Like [`read`](Self::read), but `None` when the frame is too short.
    pub fn read_exact(&mut self, n: usize, palette: &Palette) -> Option<Bits> {
        let r = self.read(n, palette);
        r.complete.then_some(r.bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BlockGrid;
    use crate::palette::builtin;
    use crate::writer::RenderJob;

    fn frame(grid: BlockGrid, palette: &Palette, bits: &Bits) -> Raster {
        let width = palette.bit_length() as usize;
        let mut colors = Vec::new();
        let mut cur = bits.cursor();
        while cur.remaining() >= width {
            colors.push(palette.encode(cur.read_uint(width).unwrap() as u32));
        }
        RenderJob { frame_number: 2, calibrator: false, colors }.render(grid, 3)
    }

    #[test]
    fn leftover_bits_serve_the_next_read() {
        let grid = BlockGrid::new(20, 20).unwrap();
        let pal = builtin(4).unwrap(); // 4 bits per block
        let data = Bits::from_bytes(&[0b1011_0110, 0b0001_1111]);
        let r = frame(grid, &pal, &data);
        let geom = FrameGeometry { grid, pixel_width: 3.0 };
        let mut s = FrameScanner::new(&r, geom, false);

        let a = s.read(3, &pal);
        assert!(a.complete);
        assert_eq!(a.bits, data.slice(0, 3));
        assert_eq!(s.leftover_bits(), 1);
        assert_eq!(s.remaining_blocks(), 399);

        let b = s.read(9, &pal);
        assert_eq!(b.bits, data.slice(3, 12));
        assert_eq!(s.leftover_bits(), 0);
        assert_eq!(s.remaining_blocks(), 397);
    }

    #[test]
    fn short_frame_is_incomplete() {
        let grid = BlockGrid::new(17, 17).unwrap();
        let pal = builtin(1).unwrap();
        let r = frame(grid, &pal, &Bits::from_bytes(&[0xAA; 4]));
        let geom = FrameGeometry { grid, pixel_width: 3.0 };
        let mut s = FrameScanner::new(&r, geom, true);
        let all = grid.content_blocks(true);
        let read = s.read(all + 5, &pal);
        assert!(!read.complete);
        assert_eq!(read.bits.len(), all);
        assert_eq!(s.remaining_blocks(), 0);
        assert!(s.read_exact(1, &pal).is_none());
    }
}
