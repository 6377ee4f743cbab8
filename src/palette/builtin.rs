//! Built-in palettes.  These ids are permanent; an id is never reused.

use super::{ColorMap, Palette, PaletteId, Rgb};

/// Palette every setup header is rendered with (one bit per block).
pub const SETUP_PALETTE_ID: u8 = 1;

const BLACK_WHITE: [Rgb; 2] = [[0, 0, 0], [255, 255, 255]];

const FOUR_PRIMARY: [Rgb; 4] = [[0, 0, 0], [255, 0, 0], [0, 255, 0], [0, 0, 255]];

const CUBE_CORNERS: [Rgb; 8] = [
    [0, 0, 0], [255, 0, 0], [0, 255, 0], [0, 0, 255],
    [255, 255, 0], [0, 255, 255], [255, 0, 255], [255, 255, 255],
];

/// Channel levels for the lattice palettes.
const LEVELS_4: [u8; 4] = [0, 85, 170, 255];

fn sixteen() -> Vec<Rgb> {
    let mut out = Vec::with_capacity(16);
    for r in [0u8, 255] {
        for g in [0u8, 255] {
            for b in LEVELS_4 {
                out.push([r, g, b]);
            }
        }
    }
    out
}

fn sixty_four() -> Vec<Rgb> {
    let mut out = Vec::with_capacity(64);
    for r in LEVELS_4 {
        for g in LEVELS_4 {
            for b in LEVELS_4 {
                out.push([r, g, b]);
            }
        }
    }
    out
}

fn indexed(colors: Vec<Rgb>, bit_length: u8) -> ColorMap {
    ColorMap::Indexed { colors, bit_length }
}

/// Look up a built-in palette by numeric id.
pub fn builtin(id: u8) -> Option<Palette> {
    let p = match id {
        1 => Palette::builtin(1, "1 bit default", "Black and white", indexed(BLACK_WHITE.to_vec(), 1)),
        2 => Palette::builtin(2, "2 bit default", "Black and the three primaries", indexed(FOUR_PRIMARY.to_vec(), 2)),
        3 => Palette::builtin(3, "3 bit default", "Corners of the RGB cube", indexed(CUBE_CORNERS.to_vec(), 3)),
        4 => Palette::builtin(4, "4 bit default", "Binary red/green, four blue levels", indexed(sixteen(), 4)),
        5 => Palette::builtin(5, "6 bit default", "Four levels per channel", indexed(sixty_four(), 6)),
        6 => Palette::builtin(6, "24 bit default", "Direct RGB, zero error margin", ColorMap::Direct24),
        _ => return None,
    };
    Some(p)
}

pub fn builtin_palettes() -> Vec<Palette> {
    (1..=6).filter_map(builtin).collect()
}

pub fn setup_palette() -> Palette {
    Palette::builtin(SETUP_PALETTE_ID, "1 bit default", "Black and white", indexed(BLACK_WHITE.to_vec(), 1))
}

impl PaletteId {
    pub fn is_known_builtin(self) -> bool {
        matches!(self, PaletteId::Builtin(n) if builtin(n).is_some())
    }
}
