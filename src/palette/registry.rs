//! Explicit palette registry passed into the encode/decode entry points.

use std::collections::HashMap;

use tracing::debug;

use super::{builtin_palettes, ColorMap, Palette, PaletteError, PaletteId};

#[derive(Debug, Clone, Default)]
pub struct PaletteRegistry {
    palettes: HashMap<PaletteId, Palette>,
}

impl PaletteRegistry {
    /// Registry holding only the built-in palettes.
    pub fn with_builtins() -> Self {
        let mut reg = Self::default();
        for p in builtin_palettes() {
            reg.palettes.insert(p.id, p);
        }
        reg
    }

    pub fn get(&self, id: PaletteId) -> Result<&Palette, PaletteError> {
        self.palettes.get(&id).ok_or(match id {
            PaletteId::Builtin(n) => PaletteError::UnknownBuiltin(n),
            PaletteId::Custom(_) => PaletteError::NotFound(id),
        })
    }

    pub fn contains(&self, id: PaletteId) -> bool {
        self.palettes.contains_key(&id)
    }

    /// Add a custom palette.  Re-adding a known id keeps the existing entry
    /// (and its nickname).
    ///
    /// The palette is rebuilt from its name, description, timestamp and
    /// colors, so a deserialized record with a forged id, duplicate colors or
    /// a stale bit length is refused here rather than at encode time.
    pub fn insert_custom(&mut self, palette: Palette) -> Result<(), PaletteError> {
        if !palette.is_custom() {
            return Err(PaletteError::PaletteInvalid(format!(
                "built-in id {} cannot be registered as custom",
                palette.id
            )));
        }
        let Palette { id, name, description, created_at, map, nickname, .. } = palette;
        if map == ColorMap::Direct24 {
            return Err(PaletteError::PaletteInvalid("custom palettes must list their colors".into()));
        }
        let mut palette = Palette::custom(name, description, created_at, map.colors().to_vec())?;
        if palette.map != map {
            return Err(PaletteError::PaletteInvalid(format!(
                "bit length {} does not fit {} colors",
                map.bit_length(),
                map.color_count()
            )));
        }
        if palette.id != id {
            return Err(PaletteError::PaletteInvalid(format!(
                "id {id} does not match content (expected {})",
                palette.id
            )));
        }
        palette.nickname = nickname;
        if !self.palettes.contains_key(&palette.id) {
            debug!(palette = %palette.id, name = %palette.name, "registered custom palette");
            self.palettes.insert(palette.id, palette);
        }
        Ok(())
    }

    pub fn remove_custom(&mut self, id: PaletteId) -> Option<Palette> {
        if id.is_custom() { self.palettes.remove(&id) } else { None }
    }

    pub fn set_nickname(&mut self, id: PaletteId, nickname: Option<String>) -> Result<(), PaletteError> {
        let p = self.palettes.get_mut(&id).ok_or(PaletteError::NotFound(id))?;
        p.set_nickname(nickname);
        Ok(())
    }

    pub fn find_by_nickname(&self, nickname: &str) -> Option<&Palette> {
        self.palettes.values().find(|p| p.nickname.as_deref() == Some(nickname))
    }

    /// Palettes sorted with built-ins first (by id), then custom by name.
    pub fn list(&self) -> Vec<&Palette> {
        let mut out: Vec<&Palette> = self.palettes.values().collect();
        out.sort_by(|a, b| match (a.id, b.id) {
            (PaletteId::Builtin(x), PaletteId::Builtin(y)) => x.cmp(&y),
            (PaletteId::Builtin(_), PaletteId::Custom(_)) => std::cmp::Ordering::Less,
            (PaletteId::Custom(_), PaletteId::Builtin(_)) => std::cmp::Ordering::Greater,
            _ => a.name.cmp(&b.name),
        });
        out
    }
}
