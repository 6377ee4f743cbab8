//! Palettes: the bidirectional mapping between bit groups and block colors.
//!
//! # Identity rules
//! Built-in palettes carry a small numeric id that is frozen forever.
//! Custom palettes are identified by a SHA-256 over their defining fields
//! (name, description, creation time, colors), so two parties that build the
//! same palette independently agree on its id.  The nickname is a local label
//! only and never participates in identity.
//!
//! # Color mapping
//! [`ColorMap::Indexed`] palettes hold 2..=256 colors (a power of two); the
//! bit group `v` is rendered as `colors[v]`.  Decoding snaps an observed,
//! possibly noisy color to the nearest palette entry (Euclidean RGB distance,
//! first minimum wins) and returns that entry's index.
//!
//! [`ColorMap::Direct24`] writes the 24 bits straight into the three channels.
//! There is no snapping, so any channel deviation corrupts data.

pub mod builtin;
pub mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use builtin::{builtin, builtin_palettes, setup_palette, SETUP_PALETTE_ID};
pub use registry::PaletteRegistry;

/// One RGB triple.
pub type Rgb = [u8; 3];

/// Largest palette the indexed mode supports.
pub const MAX_INDEXED_COLORS: usize = 256;

/// Bit length of the direct-RGB mode.
pub const DIRECT24_BITS: u8 = 24;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaletteError {
    #[error("Palette invalid: {0}")]
    PaletteInvalid(String),
    #[error("Unknown built-in palette id {0}")]
    UnknownBuiltin(u8),
    #[error("Palette {0} is not in the registry")]
    NotFound(PaletteId),
}

// ── Identity ─────────────────────────────────────────────────────────────────

/// Palette identity as carried in the initializer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaletteId {
    Builtin(u8),
    Custom([u8; 32]),
}

impl PaletteId {
    /// 256-bit wire form.  Built-in ids are right-aligned in the field.
    pub fn to_field(self) -> [u8; 32] {
        match self {
            PaletteId::Builtin(n) => {
                let mut out = [0u8; 32];
                out[31] = n;
                out
            }
            PaletteId::Custom(hash) => hash,
        }
    }

    pub fn from_field(field: [u8; 32]) -> Self {
        if field[..31].iter().all(|&b| b == 0) {
            PaletteId::Builtin(field[31])
        } else {
            PaletteId::Custom(field)
        }
    }

    pub fn is_custom(self) -> bool {
        matches!(self, PaletteId::Custom(_))
    }

    /// Parse `"3"` as a built-in id or a 64-char hex string as a custom id.
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(n) = s.parse::<u8>() {
            return Some(PaletteId::Builtin(n));
        }
        let raw = hex::decode(s.trim()).ok()?;
        let hash: [u8; 32] = raw.try_into().ok()?;
        Some(PaletteId::Custom(hash))
    }
}

impl fmt::Display for PaletteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaletteId::Builtin(n) => write!(f, "{n}"),
            PaletteId::Custom(h) => write!(f, "{}", hex::encode(h)),
        }
    }
}

// ── Color mapping ────────────────────────────────────────────────────────────

/// Euclidean distance between two colors in RGB space.
#[inline]
pub fn color_distance(a: Rgb, b: Rgb) -> f64 {
    (distance_sq(a, b) as f64).sqrt()
}

#[inline]
fn distance_sq(a: Rgb, b: Rgb) -> u32 {
    let dr = a[0] as i32 - b[0] as i32;
    let dg = a[1] as i32 - b[1] as i32;
    let db = a[2] as i32 - b[2] as i32;
    (dr * dr + dg * dg + db * db) as u32
}

/// Index and color of the entry nearest to `observed`.  Ties go to the
/// earliest entry.
pub fn nearest(colors: &[Rgb], observed: Rgb) -> (usize, Rgb) {
    let mut best = (0usize, u32::MAX);
    for (i, &c) in colors.iter().enumerate() {
        let d = distance_sq(c, observed);
        if d < best.1 {
            best = (i, d);
        }
    }
    (best.0, colors[best.0])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorMap {
    Indexed { colors: Vec<Rgb>, bit_length: u8 },
    Direct24,
}

impl ColorMap {
    /// Validate a color list and derive its bit length.
    pub fn indexed(colors: Vec<Rgb>) -> Result<Self, PaletteError> {
        let n = colors.len();
        if n < 2 || n > MAX_INDEXED_COLORS || !n.is_power_of_two() {
            return Err(PaletteError::PaletteInvalid(format!(
                "color count {n} must be a power of two between 2 and {MAX_INDEXED_COLORS}"
            )));
        }
        if min_pairwise_distance(&colors) <= 0.0 {
            return Err(PaletteError::PaletteInvalid("duplicate colors".into()));
        }
        let bit_length = n.trailing_zeros() as u8;
        Ok(ColorMap::Indexed { colors, bit_length })
    }

    pub fn bit_length(&self) -> u8 {
        match self {
            ColorMap::Indexed { bit_length, .. } => *bit_length,
            ColorMap::Direct24 => DIRECT24_BITS,
        }
    }

    /// Color for the bit group `value` (low `bit_length` bits are used).
    pub fn encode(&self, value: u32) -> Rgb {
        match self {
            ColorMap::Indexed { colors, bit_length } => {
                colors[(value & ((1u32 << bit_length) - 1)) as usize]
            }
            ColorMap::Direct24 => [(value >> 16) as u8, (value >> 8) as u8, value as u8],
        }
    }

    /// Bit group for an observed color.
    pub fn decode(&self, observed: Rgb) -> u32 {
        match self {
            ColorMap::Indexed { colors, .. } => nearest(colors, observed).0 as u32,
            ColorMap::Direct24 => {
                ((observed[0] as u32) << 16) | ((observed[1] as u32) << 8) | observed[2] as u32
            }
        }
    }

    pub fn color_count(&self) -> usize {
        match self {
            ColorMap::Indexed { colors, .. } => colors.len(),
            ColorMap::Direct24 => 1 << 24,
        }
    }

    pub fn colors(&self) -> &[Rgb] {
        match self {
            ColorMap::Indexed { colors, .. } => colors,
            ColorMap::Direct24 => &[],
        }
    }
}

/// Minimum pairwise distance; `0.0` means at least one duplicate.
pub fn min_pairwise_distance(colors: &[Rgb]) -> f64 {
    let mut best = u32::MAX;
    for (i, &a) in colors.iter().enumerate() {
        for &b in &colors[i + 1..] {
            best = best.min(distance_sq(a, b));
        }
    }
    if best == u32::MAX { f64::INFINITY } else { (best as f64).sqrt() }
}

// ── Palette ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Palette {
    pub id:           PaletteId,
    pub name:         String,
    pub description:  String,
    /// Unix seconds; zero for built-ins.
    pub created_at:   i64,
    pub map:          ColorMap,
    pub min_distance: f64,
    /// Local label, detachable; not part of identity.
    #[serde(default)]
    pub nickname:     Option<String>,
}

impl Palette {
    pub(crate) fn builtin(id: u8, name: &str, description: &str, map: ColorMap) -> Self {
        let min_distance = match &map {
            ColorMap::Indexed { colors, .. } => min_pairwise_distance(colors),
            ColorMap::Direct24 => 1.0,
        };
        Self {
            id: PaletteId::Builtin(id),
            name: name.to_owned(),
            description: description.to_owned(),
            created_at: 0,
            map,
            min_distance,
            nickname: None,
        }
    }

    /// Create a custom palette; the id is derived from the content.
    pub fn custom(
        name:        impl Into<String>,
        description: impl Into<String>,
        created_at:  i64,
        colors:      Vec<Rgb>,
    ) -> Result<Self, PaletteError> {
        let name = name.into();
        let description = description.into();
        let map = ColorMap::indexed(colors)?;
        let min_distance = min_pairwise_distance(map.colors());
        let id = PaletteId::Custom(custom_palette_id(&name, &description, created_at, map.colors()));
        Ok(Self { id, name, description, created_at, map, min_distance, nickname: None })
    }

    #[inline]
    pub fn bit_length(&self) -> u8 {
        self.map.bit_length()
    }

    #[inline]
    pub fn encode(&self, value: u32) -> Rgb {
        self.map.encode(value)
    }

    #[inline]
    pub fn decode(&self, observed: Rgb) -> u32 {
        self.map.decode(observed)
    }

    pub fn is_custom(&self) -> bool {
        self.id.is_custom()
    }

    pub fn is_direct24(&self) -> bool {
        matches!(self.map, ColorMap::Direct24)
    }

    pub fn set_nickname(&mut self, nickname: Option<String>) {
        self.nickname = nickname;
    }
}

/// SHA-256 over the fields that define a custom palette.
pub fn custom_palette_id(name: &str, description: &str, created_at: i64, colors: &[Rgb]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(name.as_bytes());
    h.update(description.as_bytes());
    h.update(created_at.to_string().as_bytes());
    for c in colors {
        h.update(c);
    }
    h.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn duplicate_colors_rejected() {
        let err = Palette::custom("dup", "", 0, vec![[1, 2, 3], [1, 2, 3]]).unwrap_err();
        assert!(matches!(err, PaletteError::PaletteInvalid(_)));
    }

    #[test]
    fn non_power_of_two_rejected() {
        let err = ColorMap::indexed(vec![[0, 0, 0], [255, 0, 0], [0, 255, 0]]).unwrap_err();
        assert!(matches!(err, PaletteError::PaletteInvalid(_)));
        assert!(ColorMap::indexed(vec![[0, 0, 0]]).is_err());
    }

    #[test]
    fn snapping_prefers_first_minimum() {
        let map = ColorMap::indexed(vec![[0, 0, 0], [100, 0, 0]]).unwrap();
        assert_eq!(map.decode([50, 0, 0]), 0);
        assert_eq!(map.decode([51, 0, 0]), 1);
        assert_eq!(map.decode([90, 20, 10]), 1);
    }

    #[test]
    fn direct24_is_exact() {
        let map = ColorMap::Direct24;
        let v = 0x12_34_56;
        assert_eq!(map.encode(v), [0x12, 0x34, 0x56]);
        assert_eq!(map.decode([0x12, 0x34, 0x56]), v);
        assert_ne!(map.decode([0x12, 0x34, 0x57]), v);
    }

    #[test]
    fn custom_id_is_content_derived() {
        let a = Palette::custom("sunset", "warm", 1_700_000_000, vec![[0, 0, 0], [255, 128, 0]]).unwrap();
        let b = Palette::custom("sunset", "warm", 1_700_000_000, vec![[0, 0, 0], [255, 128, 0]]).unwrap();
        let c = Palette::custom("sunset", "warm", 1_700_000_001, vec![[0, 0, 0], [255, 128, 0]]).unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert!(a.id.is_custom());
    }

    #[test]
    fn palette_id_field_roundtrip() {
        let b = PaletteId::Builtin(5);
        assert_eq!(PaletteId::from_field(b.to_field()), b);
        let c = PaletteId::Custom([0xAB; 32]);
        assert_eq!(PaletteId::from_field(c.to_field()), c);
        assert_eq!(PaletteId::parse("5"), Some(b));
        assert_eq!(PaletteId::parse(&c.to_string()), Some(c));
    }

    fn distinct_colors(n: usize) -> impl Strategy<Value = Vec<Rgb>> {
        proptest::collection::hash_set(any::<[u8; 3]>(), n).prop_map(|s| s.into_iter().collect())
    }

    proptest! {
        #[test]
        fn bit_length_is_log2_of_count(exp in 1u32..=8, seed in any::<u64>()) {
            let n = 1usize << exp;
            let colors: Vec<Rgb> = (0..n)
                .map(|i| {
                    let v = (i as u64).wrapping_mul(0x9E37_79B9).wrapping_add(seed) as u32;
                    [(i & 0xFF) as u8, (v >> 8) as u8, (v >> 16) as u8]
                })
                .collect();
            let map = ColorMap::indexed(colors).unwrap();
            prop_assert_eq!(map.color_count(), n);
            prop_assert_eq!(1usize << map.bit_length(), n);
        }

        #[test]
        fn exact_colors_decode_to_their_index(colors in distinct_colors(16)) {
            let map = ColorMap::indexed(colors.clone()).unwrap();
            for (i, c) in colors.iter().enumerate() {
                prop_assert_eq!(map.decode(*c), i as u32);
                prop_assert_eq!(map.encode(i as u32), *c);
            }
        }
    }
}
