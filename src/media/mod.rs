//! Frame I/O boundary.
//!
//! The codec only sees [`Raster`]s.  Containers (a directory of PNGs, frames
//! held in memory) plug in through [`FrameSource`] and [`FrameSink`].

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::debug;

use crate::geometry::Raster;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Bad frame {path}: {reason}")]
    BadFrame { path: String, reason: String },
}

/// Ordered supply of frames.
pub trait FrameSource {
    /// `None` once the source is exhausted.
    fn next_frame(&mut self) -> Option<Result<Raster, MediaError>>;
}

/// Consumer of rendered frames, called in frame order.
pub trait FrameSink {
    fn accept(&mut self, frame_number: u32, raster: Raster) -> Result<(), MediaError>;

    fn finish(&mut self) -> Result<(), MediaError> {
        Ok(())
    }
}

// ── Memory ───────────────────────────────────────────────────────────────────

/// Frames held in memory; both a source and a sink.
#[derive(Debug, Clone, Default)]
pub struct MemoryFrames {
    frames: VecDeque<Raster>,
}

impl MemoryFrames {
    pub fn new(frames: Vec<Raster>) -> Self {
        Self { frames: frames.into() }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn into_frames(self) -> Vec<Raster> {
        self.frames.into()
    }
}

impl FrameSource for MemoryFrames {
    fn next_frame(&mut self) -> Option<Result<Raster, MediaError>> {
        self.frames.pop_front().map(Ok)
    }
}

impl FrameSink for MemoryFrames {
    fn accept(&mut self, _frame_number: u32, raster: Raster) -> Result<(), MediaError> {
        self.frames.push_back(raster);
        Ok(())
    }
}

impl FrameSink for Vec<Raster> {
    fn accept(&mut self, _frame_number: u32, raster: Raster) -> Result<(), MediaError> {
        self.push(raster);
        Ok(())
    }
}

// ── PNG directory ────────────────────────────────────────────────────────────

/// One PNG per frame, `frame_000001.png` upward.  Reading takes every `.png`
/// in the directory in file-name order.
#[derive(Debug)]
pub struct PngDirectory {
    dir:     PathBuf,
    pending: VecDeque<PathBuf>,
    written: u32,
}

impl PngDirectory {
    /// Directory to write frames into; created if missing.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, MediaError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, pending: VecDeque::new(), written: 0 })
    }

    /// Directory to read frames from.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MediaError> {
        let dir = dir.as_ref().to_path_buf();
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_png = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("png"));
            if is_png {
                files.push(path);
            }
        }
        files.sort();
        debug!(dir = %dir.display(), frames = files.len(), "opened frame directory");
        Ok(Self { dir, pending: files.into(), written: 0 })
    }

    pub fn frame_path(&self, frame_number: u32) -> PathBuf {
        self.dir.join(format!("frame_{frame_number:06}.png"))
    }

    pub fn frames_written(&self) -> u32 {
        self.written
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

pub fn read_png(path: &Path) -> Result<Raster, MediaError> {
    let img = image::open(path)?.into_rgb8();
    let (w, h) = img.dimensions();
    Raster::from_rgb(w, h, img.into_raw()).ok_or_else(|| MediaError::BadFrame {
        path:   path.display().to_string(),
        reason: "pixel buffer does not match dimensions".into(),
    })
}

pub fn write_png(path: &Path, raster: &Raster) -> Result<(), MediaError> {
    let img = RgbImage::from_raw(raster.width(), raster.height(), raster.as_rgb().to_vec()).ok_or_else(|| {
        MediaError::BadFrame {
            path:   path.display().to_string(),
            reason: "raster buffer does not match dimensions".into(),
        }
    })?;
    img.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

impl FrameSource for PngDirectory {
    fn next_frame(&mut self) -> Option<Result<Raster, MediaError>> {
        let path = self.pending.pop_front()?;
        Some(read_png(&path))
    }
}

impl FrameSink for PngDirectory {
    fn accept(&mut self, frame_number: u32, raster: Raster) -> Result<(), MediaError> {
        write_png(&self.frame_path(frame_number), &raster)?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MediaError> {
        debug!(dir = %self.dir.display(), frames = self.written, "frame directory written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_directory_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = Raster::new(6, 4);
        a.fill_rect(0, 0, 3, 4, [255, 0, 0]);
        let b = Raster::new(6, 4);

        let mut sink = PngDirectory::create(dir.path()).unwrap();
        sink.accept(2, b.clone()).unwrap();
        sink.accept(1, a.clone()).unwrap();
        sink.finish().unwrap();
        assert_eq!(sink.frames_written(), 2);

        let mut src = PngDirectory::open(dir.path()).unwrap();
        assert_eq!(src.remaining(), 2);
        assert_eq!(src.next_frame().unwrap().unwrap(), a);
        assert_eq!(src.next_frame().unwrap().unwrap(), b);
        assert!(src.next_frame().is_none());
    }

    #[test]
    fn memory_frames_are_fifo() {
        let mut m = MemoryFrames::default();
        m.accept(1, Raster::new(1, 1)).unwrap();
        m.accept(2, Raster::new(2, 2)).unwrap();
        assert_eq!(m.next_frame().unwrap().unwrap().width(), 1);
        assert_eq!(m.len(), 1);
    }
}
