//! Per-stream reassembly.
//!
//! # Phases
//! A [`StreamAssemblyState`] is created when a stream id is first seen and
//! moves `AwaitingGeometry → AwaitingStreamHeader → AwaitingMetadataAndPalette
//! → PayloadIngest → Assembled`.  Frames that carry setup-header bits are
//! consumed strictly in frame order, one at a time; everything they parse is
//! tentative until the frame's content hash verifies.  Frames after the setup
//! region may arrive in any order and from many threads.
//!
//! # Strikes
//! Any frame-local failure (lock-on, header CRC, content hash, truncation)
//! adds one strike.  The counter is atomic so parallel workers share it.  The
//! stream is abandoned once strikes exceed the configured limit.
//!
//! # Persistence
//! The state is plain serde data and round-trips through JSON, so an
//! interrupted decode can resume from the file later.

pub mod bitmap;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bits::Bits;
use crate::config::OutputMode;
use crate::crypto::Credentials;
use crate::geometry::{BlockGrid, GeometryError};
use crate::header::metadata::decode_metadata;
use crate::header::palette::decode_palette_header;
use crate::header::{
    sha256, FrameHeader, HeaderError, InitializerHeader, MetadataOutcome, PaletteResolution, StreamHeader,
    StreamMetadata, STREAM_HEADER_BITS,
};
use crate::palette::{setup_palette, Palette, PaletteError, PaletteRegistry, DIRECT24_BITS};
use crate::scanner::FrameScanner;

pub use bitmap::CompletionBitmap;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that end a stream's assembly (or a persistence call).
#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("Stream {stream} abandoned after {strikes} bad frame(s), limit {limit}")]
    StreamAbandoned { stream: String, strikes: u32, limit: u32 },
    #[error("Reassembled payload does not match stream id {0}")]
    PayloadHashMismatch(String),
    #[error("Stream incomplete: {missing} frame(s) missing")]
    Incomplete { missing: usize },
    #[error("Palette error: {0}")]
    Palette(#[from] PaletteError),
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("State serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Saved state is inconsistent: {0}")]
    CorruptState(String),
}

/// Why a single frame was rejected.  Each one is a strike.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameFault {
    #[error("lock-on failed: {0}")]
    Geometry(#[from] GeometryError),
    #[error("header rejected: {0}")]
    Header(#[from] HeaderError),
    #[error("frame ran out of blocks")]
    Truncated,
    #[error("frame content does not match its hash")]
    ContentHash,
    #[error("frame number {0} outside 1..={1}")]
    FrameNumber(u32, u32),
    #[error("frame {0} already received")]
    Duplicate(u32),
    #[error("{0}")]
    Inconsistent(String),
}

/// What happened to one frame handed to a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted,
    /// Already have it; skipped without a strike.
    Duplicate,
    /// Carries setup bits but an earlier setup frame is still missing.
    Deferred,
    Rejected(FrameFault),
}

// ── Phase ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    AwaitingGeometry,
    AwaitingStreamHeader,
    AwaitingMetadataAndPalette,
    PayloadIngest,
    Assembled,
}

impl Phase {
    pub fn in_setup(self) -> bool {
        matches!(self, Phase::AwaitingStreamHeader | Phase::AwaitingMetadataAndPalette)
    }
}

/// Setup header the content stream is currently inside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
enum SetupStage {
    #[default]
    StreamHeader,
    Metadata,
    Palette,
    Done,
}

impl SetupStage {
    fn bit_len(self, sh: Option<&StreamHeader>) -> usize {
        match self {
            SetupStage::StreamHeader => STREAM_HEADER_BITS,
            SetupStage::Metadata => sh.map_or(0, |h| h.metadata_len as usize * 8),
            SetupStage::Palette => sh.map_or(0, |h| h.palette_header_len as usize * 8),
            SetupStage::Done => 0,
        }
    }

    fn after_stream_header(sh: &StreamHeader) -> Self {
        if sh.metadata_len > 0 {
            SetupStage::Metadata
        } else {
            Self::after_metadata(sh)
        }
    }

    fn after_metadata(sh: &StreamHeader) -> Self {
        if sh.palette_header_len > 0 { SetupStage::Palette } else { SetupStage::Done }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SetupCursor {
    stage:      SetupStage,
    /// Bits of the current setup header received so far.
    pending:    Bits,
    next_frame: u32,
    /// Last frame carrying setup bits, once the setup region is complete.
    last_frame: Option<u32>,
}

impl Default for SetupCursor {
    fn default() -> Self {
        Self { stage: SetupStage::StreamHeader, pending: Bits::new(), next_frame: 1, last_frame: None }
    }
}

/// Headers parsed from a frame that has not been verified yet.
#[derive(Default)]
struct Tentative {
    stream_header: Option<StreamHeader>,
    metadata:      Option<(Vec<u8>, MetadataOutcome)>,
    palette:       Option<Palette>,
}

enum StageError {
    Frame(FrameFault),
    Fatal(AssemblyError),
}

impl From<FrameFault> for StageError {
    fn from(f: FrameFault) -> Self {
        StageError::Frame(f)
    }
}

/// Snapshot for progress displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamProgress {
    pub stream_id:       String,
    pub phase:           Phase,
    pub frames_complete: usize,
    pub total_frames:    Option<u32>,
    pub strikes:         u32,
    pub metadata_locked: bool,
}

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamAssemblyState {
    stream_id:                [u8; 32],
    mode:                     OutputMode,
    phase:                    Phase,
    strike_limit:             u32,
    strikes:                  AtomicU32,
    abandoned:                AtomicBool,
    initializer:              Option<InitializerHeader>,
    palette:                  Option<Palette>,
    stream_header:            Option<StreamHeader>,
    stream_header_complete:   bool,
    metadata_header_complete: bool,
    palette_header_complete:  bool,
    setup:                    SetupCursor,
    metadata_bytes:           Option<Vec<u8>>,
    metadata:                 Option<StreamMetadata>,
    bitmap:                   CompletionBitmap,
    /// Unpadded content bits contributed to the payload by each frame.
    frames:                   BTreeMap<u32, Bits>,
}

impl StreamAssemblyState {
    pub fn new(stream_id: [u8; 32], mode: OutputMode, strike_limit: u32) -> Self {
        Self {
            stream_id,
            mode,
            phase: Phase::AwaitingGeometry,
            strike_limit,
            strikes: AtomicU32::new(0),
            abandoned: AtomicBool::new(false),
            initializer: None,
            palette: None,
            stream_header: None,
            stream_header_complete: false,
            metadata_header_complete: false,
            palette_header_complete: false,
            setup: SetupCursor::default(),
            metadata_bytes: None,
            metadata: None,
            bitmap: CompletionBitmap::default(),
            frames: BTreeMap::new(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn stream_id(&self) -> &[u8; 32] {
        &self.stream_id
    }

    pub fn stream_id_hex(&self) -> String {
        hex::encode(self.stream_id)
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn initializer(&self) -> Option<&InitializerHeader> {
        self.initializer.as_ref()
    }

    pub fn stream_header(&self) -> Option<&StreamHeader> {
        self.stream_header.as_ref()
    }

    pub fn palette(&self) -> Option<&Palette> {
        self.palette.as_ref()
    }

    pub fn metadata(&self) -> Option<&StreamMetadata> {
        self.metadata.as_ref()
    }

    /// `(stream, metadata, palette)` header completion flags.
    pub fn headers_complete(&self) -> (bool, bool, bool) {
        (self.stream_header_complete, self.metadata_header_complete, self.palette_header_complete)
    }

    /// Frame that must arrive next while setup headers are being read.
    pub fn next_setup_frame(&self) -> Option<u32> {
        self.phase.in_setup().then_some(self.setup.next_frame)
    }

    pub fn last_setup_frame(&self) -> Option<u32> {
        self.setup.last_frame
    }

    pub fn strikes(&self) -> u32 {
        self.strikes.load(Ordering::Acquire)
    }

    pub fn strike_limit(&self) -> u32 {
        self.strike_limit
    }

    /// Resumed states keep their own limit unless the caller overrides it.
    pub fn set_strike_limit(&mut self, limit: u32) {
        self.strike_limit = limit;
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        match &self.stream_header {
            Some(sh) => {
                !self.phase.in_setup()
                    && self.bitmap.is_full()
                    && self.frames.len() == sh.total_frames as usize
            }
            None => false,
        }
    }

    pub fn is_frame_complete(&self, frame_number: u32) -> bool {
        self.bitmap.is_set(frame_number)
    }

    pub fn progress(&self) -> StreamProgress {
        StreamProgress {
            stream_id:       self.stream_id_hex(),
            phase:           self.phase,
            frames_complete: self.bitmap.count(),
            total_frames:    self.stream_header.as_ref().map(|h| h.total_frames),
            strikes:         self.strikes(),
            metadata_locked: self.metadata_header_complete && self.metadata.is_none(),
        }
    }

    pub fn abandoned_error(&self) -> AssemblyError {
        AssemblyError::StreamAbandoned {
            stream:  self.stream_id_hex(),
            strikes: self.strikes(),
            limit:   self.strike_limit,
        }
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    /// Bind the initializer.  An unknown built-in palette is fatal; an
    /// unknown custom palette waits for the custom-palette header.
    pub fn attach_initializer(
        &mut self,
        initializer: InitializerHeader,
        registry:    &PaletteRegistry,
    ) -> Result<(), AssemblyError> {
        if self.phase != Phase::AwaitingGeometry {
            return Ok(());
        }
        if let PaletteResolution::Known(p) = initializer.resolve_palette(registry)? {
            self.palette = Some(p);
        }
        debug!(
            stream = %self.stream_id_hex(),
            palette = %initializer.palette_id,
            height = initializer.grid.block_height,
            width = initializer.grid.block_width,
            "initializer accepted"
        );
        self.initializer = Some(initializer);
        self.phase = Phase::AwaitingStreamHeader;
        Ok(())
    }

    /// Count one bad frame.  Returns true when this strike abandons the stream.
    pub fn record_strike(&self, fault: &FrameFault) -> bool {
        let n = self.strikes.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(stream = %self.stream_id_hex(), strikes = n, limit = self.strike_limit, %fault, "bad frame");
        if n > self.strike_limit {
            self.abandoned.store(true, Ordering::Release);
            error!(stream = %self.stream_id_hex(), strikes = n, "stream abandoned");
            return true;
        }
        false
    }

    /// Consume the next setup frame.  `scanner` must be positioned just past
    /// the frame header.
    pub fn ingest_setup_frame(
        &mut self,
        scanner:     &mut FrameScanner<'_>,
        header:      &FrameHeader,
        registry:    &mut PaletteRegistry,
        credentials: Option<&Credentials>,
    ) -> Result<Verdict, AssemblyError> {
        if !self.phase.in_setup() {
            return Ok(Verdict::Rejected(FrameFault::Inconsistent(format!(
                "stream is in {:?}, not reading setup headers",
                self.phase
            ))));
        }
        let n = header.frame_number;
        if n < self.setup.next_frame {
            return Ok(Verdict::Duplicate);
        }
        if n > self.setup.next_frame {
            return Ok(Verdict::Deferred);
        }
        if let Some(sh) = &self.stream_header {
            if n > sh.total_frames {
                return Ok(Verdict::Rejected(FrameFault::FrameNumber(n, sh.total_frames)));
            }
        }

        let setup_pal = setup_palette();
        let mut cursor = self.setup.clone();
        let mut tentative = Tentative::default();
        let mut content = Bits::new();
        let mut budget = header.payload_bit_len as usize;

        while cursor.stage != SetupStage::Done && budget > 0 {
            let stage_len = cursor
                .stage
                .bit_len(tentative.stream_header.as_ref().or(self.stream_header.as_ref()));
            let want = (stage_len - cursor.pending.len()).min(budget);
            let Some(bits) = scanner.read_exact(want, &setup_pal) else {
                return Ok(Verdict::Rejected(FrameFault::Truncated));
            };
            content.extend(&bits);
            cursor.pending.extend(&bits);
            budget -= want;
            if cursor.pending.len() < stage_len {
                break;
            }
            let finished = std::mem::take(&mut cursor.pending);
            match self.finish_stage(cursor.stage, &finished, n, &mut tentative) {
                Ok(next) => cursor.stage = next,
                Err(StageError::Frame(f)) => return Ok(Verdict::Rejected(f)),
                Err(StageError::Fatal(e)) => return Err(e),
            }
        }

        let mut payload = Bits::new();
        if budget > 0 {
            let Some(palette) = tentative.palette.as_ref().or(self.palette.as_ref()) else {
                return Ok(Verdict::Rejected(FrameFault::Inconsistent("payload precedes palette".into())));
            };
            let width = palette.bit_length() as usize;
            let Some(bits) = scanner.read_exact(budget.div_ceil(width) * width, palette) else {
                return Ok(Verdict::Rejected(FrameFault::Truncated));
            };
            content.extend(&bits);
            payload = bits.slice(0, budget);
        }

        if !header.matches(&content) {
            return Ok(Verdict::Rejected(FrameFault::ContentHash));
        }

        self.commit_setup_frame(n, cursor, tentative, payload, registry)?;
        if let Some(c) = credentials {
            if self.metadata_header_complete && self.metadata.is_none() {
                if let Err(e) = self.unlock_metadata(c) {
                    warn!(stream = %self.stream_id_hex(), error = %e, "metadata stays locked");
                }
            }
        }
        Ok(Verdict::Accepted)
    }

    fn finish_stage(
        &self,
        stage:        SetupStage,
        bits:         &Bits,
        frame_number: u32,
        tentative:    &mut Tentative,
    ) -> Result<SetupStage, StageError> {
        match stage {
            SetupStage::StreamHeader => {
                let sh = StreamHeader::decode(bits).map_err(FrameFault::from)?;
                if frame_number > sh.total_frames {
                    return Err(FrameFault::FrameNumber(frame_number, sh.total_frames).into());
                }
                let grid = self.initializer.as_ref().map(|i| i.grid);
                if !plausible_layout(&sh, grid) {
                    return Err(FrameFault::Inconsistent(format!(
                        "{} frame(s) cannot carry {} payload byte(s)",
                        sh.total_frames, sh.size_bytes
                    ))
                    .into());
                }
                if self.palette.is_none() && sh.palette_header_len == 0 {
                    let id = self.initializer.as_ref().map(|i| i.palette_id);
                    return Err(StageError::Fatal(match id {
                        Some(id) => PaletteError::NotFound(id).into(),
                        None => HeaderError::FieldRange("stream header before initializer".into()).into(),
                    }));
                }
                let next = SetupStage::after_stream_header(&sh);
                tentative.stream_header = Some(sh);
                Ok(next)
            }
            SetupStage::Metadata => {
                let sh = self.active_stream_header(tentative)?;
                let bytes = bits.as_bytes().to_vec();
                // Masked headers are only opened after the frame verifies.
                let outcome = decode_metadata(&bytes, &sh.metadata_sha256, sh.masking, None)
                    .map_err(FrameFault::from)?;
                let next = SetupStage::after_metadata(sh);
                tentative.metadata = Some((bytes, outcome));
                Ok(next)
            }
            SetupStage::Palette => {
                let sh = self.active_stream_header(tentative)?;
                let expected = self
                    .initializer
                    .as_ref()
                    .map(|i| i.palette_id)
                    .ok_or_else(|| FrameFault::Inconsistent("palette header before initializer".into()))?;
                let palette = decode_palette_header(bits.as_bytes(), &sh.palette_header_sha256, expected)
                    .map_err(FrameFault::from)?;
                tentative.palette = Some(palette);
                Ok(SetupStage::Done)
            }
            SetupStage::Done => Ok(SetupStage::Done),
        }
    }

    fn active_stream_header<'a>(&'a self, tentative: &'a Tentative) -> Result<&'a StreamHeader, FrameFault> {
        tentative
            .stream_header
            .as_ref()
            .or(self.stream_header.as_ref())
            .ok_or_else(|| FrameFault::Inconsistent("setup header before stream header".into()))
    }

    fn commit_setup_frame(
        &mut self,
        frame_number: u32,
        mut cursor:   SetupCursor,
        tentative:    Tentative,
        payload:      Bits,
        registry:     &mut PaletteRegistry,
    ) -> Result<(), AssemblyError> {
        self.frames.insert(frame_number, payload);

        if let Some(sh) = tentative.stream_header {
            info!(
                stream = %self.stream_id_hex(),
                frames = sh.total_frames,
                bytes = sh.size_bytes,
                compressed = sh.compression,
                encrypted = sh.encryption,
                "stream header decoded"
            );
            self.bitmap = CompletionBitmap::new(sh.total_frames);
            // Earlier setup frames were accepted before the bitmap existed.
            for &f in self.frames.keys() {
                self.bitmap.claim(f);
            }
            self.stream_header_complete = true;
            self.metadata_header_complete = sh.metadata_len == 0;
            self.palette_header_complete = sh.palette_header_len == 0;
            self.stream_header = Some(sh);
            self.phase = Phase::AwaitingMetadataAndPalette;
        } else {
            self.bitmap.claim(frame_number);
        }

        if let Some((bytes, outcome)) = tentative.metadata {
            if let MetadataOutcome::Decoded(m) = outcome {
                debug!(stream = %self.stream_id_hex(), name = %m.stream_name, "metadata decoded");
                self.metadata = Some(m);
            }
            self.metadata_bytes = Some(bytes);
            self.metadata_header_complete = true;
        }

        if let Some(p) = tentative.palette {
            registry.insert_custom(p.clone())?;
            if self.palette.is_none() {
                self.palette = Some(p);
            }
            self.palette_header_complete = true;
        }

        cursor.next_frame = frame_number + 1;
        if cursor.stage == SetupStage::Done {
            cursor.last_frame = Some(frame_number);
            self.phase = Phase::PayloadIngest;
            debug!(stream = %self.stream_id_hex(), last_setup_frame = frame_number, "setup headers complete");
        }
        self.setup = cursor;
        Ok(())
    }

    /// Decode a payload frame and claim its completion slot.  Takes `&self`
    /// so many frames can be decoded concurrently; `Ok(None)` is a duplicate.
    pub fn decode_payload_frame(
        &self,
        scanner: &mut FrameScanner<'_>,
        header:  &FrameHeader,
    ) -> Result<Option<Bits>, FrameFault> {
        let (Some(sh), Some(palette), Some(last)) =
            (self.stream_header.as_ref(), self.palette.as_ref(), self.setup.last_frame)
        else {
            return Err(FrameFault::Inconsistent("stream is not ingesting payload".into()));
        };
        let n = header.frame_number;
        if n == 0 || n > sh.total_frames {
            return Err(FrameFault::FrameNumber(n, sh.total_frames));
        }
        if n <= last || self.bitmap.is_set(n) {
            return Ok(None);
        }

        let len = header.payload_bit_len as usize;
        let width = palette.bit_length() as usize;
        let mut bits = scanner
            .read_exact(len.div_ceil(width) * width, palette)
            .ok_or(FrameFault::Truncated)?;
        if !header.matches(&bits) {
            return Err(FrameFault::ContentHash);
        }
        if !self.bitmap.claim(n) {
            return Ok(None);
        }
        bits.truncate(len);
        Ok(Some(bits))
    }

    /// Store bits returned by [`decode_payload_frame`](Self::decode_payload_frame).
    pub fn store_payload(&mut self, frame_number: u32, bits: Bits) {
        self.frames.insert(frame_number, bits);
    }

    /// Concatenate every frame's payload and check it against the stream id.
    pub fn assemble(&mut self) -> Result<Vec<u8>, AssemblyError> {
        let Some(sh) = &self.stream_header else {
            return Err(AssemblyError::Incomplete { missing: usize::MAX });
        };
        if !self.is_complete() {
            return Err(AssemblyError::Incomplete { missing: self.bitmap.missing().len() });
        }
        let collected: usize = self.frames.values().map(Bits::len).sum();
        let size = usize::try_from(sh.size_bytes)
            .ok()
            .filter(|s| s.checked_mul(8).is_some_and(|b| b <= collected));
        let Some(size) = size else {
            error!(stream = %self.stream_id_hex(), bytes = sh.size_bytes, collected, "payload shorter than declared");
            return Err(AssemblyError::PayloadHashMismatch(self.stream_id_hex()));
        };
        let mut bits = Bits::with_capacity(collected);
        for n in 1..=sh.total_frames {
            let part = self.frames.get(&n).ok_or(AssemblyError::Incomplete { missing: 1 })?;
            bits.extend(part);
        }
        let mut bytes = bits.into_bytes();
        if bytes.len() < size || sha256(&bytes[..size]) != self.stream_id {
            error!(stream = %self.stream_id_hex(), "payload hash mismatch");
            return Err(AssemblyError::PayloadHashMismatch(self.stream_id_hex()));
        }
        bytes.truncate(size);
        self.phase = Phase::Assembled;
        info!(stream = %self.stream_id_hex(), bytes = size, "stream assembled");
        Ok(bytes)
    }

    /// Open a masked metadata header with a password.
    pub fn unlock_metadata(&mut self, credentials: &Credentials) -> Result<&StreamMetadata, AssemblyError> {
        if self.metadata.is_none() {
            let (Some(sh), Some(bytes)) = (&self.stream_header, &self.metadata_bytes) else {
                return Err(HeaderError::MetadataCorrupt("metadata header not received yet".into()).into());
            };
            match decode_metadata(bytes, &sh.metadata_sha256, sh.masking, Some(credentials))? {
                MetadataOutcome::Decoded(m) => self.metadata = Some(m),
                MetadataOutcome::PendingDecryption => {
                    return Err(HeaderError::MetadataCorrupt("password required".into()).into());
                }
            }
        }
        self.metadata
            .as_ref()
            .ok_or_else(|| HeaderError::MetadataCorrupt("metadata unavailable".into()).into())
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    pub fn to_json(&self) -> Result<Vec<u8>, AssemblyError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, AssemblyError> {
        let state: Self = serde_json::from_slice(bytes)?;
        state.check_loaded()?;
        Ok(state)
    }

    /// Cross-field checks serde cannot express.
    fn check_loaded(&self) -> Result<(), AssemblyError> {
        let corrupt = |m: String| Err(AssemblyError::CorruptState(m));
        let Some(sh) = &self.stream_header else {
            if !self.bitmap.is_empty() {
                return corrupt("completion bitmap without a stream header".into());
            }
            return Ok(());
        };
        if !plausible_layout(sh, self.initializer.as_ref().map(|i| i.grid)) {
            return corrupt(format!("{} frame(s) cannot carry {} byte(s)", sh.total_frames, sh.size_bytes));
        }
        if self.bitmap.len() != sh.total_frames as usize {
            return corrupt(format!("{} completion slot(s) for {} frame(s)", self.bitmap.len(), sh.total_frames));
        }
        if let Some(n) = self.frames.keys().find(|&&n| !self.bitmap.is_set(n)) {
            return corrupt(format!("frame {n} stored but not marked complete"));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), AssemblyError> {
        fs::write(path, self.to_json()?)?;
        debug!(stream = %self.stream_id_hex(), path = %path.display(), "state saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, AssemblyError> {
        Self::from_json(&fs::read(path)?)
    }

    /// `<dir>/<hex stream id>.json`
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        state_path(dir, &self.stream_id)
    }
}

/// Every frame carries at least one content bit and no more than its grid
/// holds at the widest symbol size.
fn plausible_layout(sh: &StreamHeader, grid: Option<BlockGrid>) -> bool {
    let Some(content) = sh.size_bytes.checked_mul(8).and_then(|b| b.checked_add(sh.setup_bits() as u64)) else {
        return false;
    };
    let frames = u64::from(sh.total_frames);
    if frames == 0 || frames > content {
        return false;
    }
    grid.map_or(true, |g| {
        let per_frame = g.total_blocks() as u64 * u64::from(DIRECT24_BITS);
        content <= frames.saturating_mul(per_frame)
    })
}

pub fn state_path(dir: &Path, stream_id: &[u8; 32]) -> PathBuf {
    dir.join(format!("{}.json", hex::encode(stream_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{BlockGrid, FrameGeometry, Raster};
    use crate::header::FRAME_HEADER_BITS;
    use crate::palette::PaletteId;
    use crate::writer::RenderJob;

    fn initializer(id: [u8; 32]) -> InitializerHeader {
        InitializerHeader::new(BlockGrid::new(40, 40).unwrap(), PaletteId::Builtin(1), id)
    }

    /// One non-calibrator frame: frame header plus `content` in the 1-bit palette.
    fn frame(n: u32, content: &Bits, unpadded: usize) -> (Raster, FrameGeometry) {
        let grid = BlockGrid::new(40, 40).unwrap();
        let fh = FrameHeader::new(n, unpadded as u32, content);
        let mut all = fh.encode();
        all.extend(content);
        let pal = setup_palette();
        let colors = all.iter().map(|b| pal.encode(b as u32)).collect();
        let raster = RenderJob { frame_number: n, calibrator: false, colors }.render(grid, 2);
        (raster, FrameGeometry { grid, pixel_width: 2.0 })
    }

    fn stream_with_payload(payload: &[u8]) -> (StreamHeader, [u8; 32]) {
        let sh = StreamHeader {
            size_bytes:            payload.len() as u64,
            total_frames:          2,
            compression:           false,
            encryption:            false,
            masking:               false,
            metadata_len:          0,
            metadata_sha256:       [0u8; 32],
            palette_header_len:    0,
            palette_header_sha256: [0u8; 32],
        };
        (sh, sha256(payload))
    }

    fn ingest(state: &mut StreamAssemblyState, raster: &Raster, geom: FrameGeometry, reg: &mut PaletteRegistry) -> Verdict {
        let mut scanner = FrameScanner::new(raster, geom, false);
        let fh = FrameHeader::decode(&scanner.read_exact(FRAME_HEADER_BITS, &setup_palette()).unwrap()).unwrap();
        if state.phase().in_setup() {
            state.ingest_setup_frame(&mut scanner, &fh, reg, None).unwrap()
        } else {
            match state.decode_payload_frame(&mut scanner, &fh) {
                Ok(Some(bits)) => {
                    state.store_payload(fh.frame_number, bits);
                    Verdict::Accepted
                }
                Ok(None) => Verdict::Duplicate,
                Err(f) => Verdict::Rejected(f),
            }
        }
    }

    #[test]
    fn setup_then_payload_out_of_order() {
        let payload = b"hello, blocks".to_vec();
        let (sh, id) = stream_with_payload(&payload);
        let mut reg = PaletteRegistry::with_builtins();
        let mut state = StreamAssemblyState::new(id, OutputMode::Video, 5);
        state.attach_initializer(initializer(id), &reg).unwrap();

        // Frame 1: stream header plus the first 5 payload bytes.
        let mut c1 = sh.encode().unwrap();
        c1.extend(&Bits::from_bytes(&payload[..5]));
        let (r1, g) = frame(1, &c1, c1.len());
        // Frame 2: the rest.
        let c2 = Bits::from_bytes(&payload[5..]);
        let (r2, _) = frame(2, &c2, c2.len());

        assert_eq!(ingest(&mut state, &r2, g, &mut reg), Verdict::Deferred);
        assert_eq!(ingest(&mut state, &r1, g, &mut reg), Verdict::Accepted);
        assert_eq!(state.phase(), Phase::PayloadIngest);
        assert_eq!(state.headers_complete(), (true, true, true));
        assert_eq!(ingest(&mut state, &r1, g, &mut reg), Verdict::Duplicate);
        assert_eq!(ingest(&mut state, &r2, g, &mut reg), Verdict::Accepted);
        assert_eq!(ingest(&mut state, &r2, g, &mut reg), Verdict::Duplicate);
        assert!(state.is_complete());
        assert_eq!(state.assemble().unwrap(), payload);
        assert_eq!(state.phase(), Phase::Assembled);
    }

    #[test]
    fn corrupt_content_is_a_strike_and_state_is_untouched() {
        let payload = b"abc".to_vec();
        let (sh, id) = stream_with_payload(&payload);
        let mut reg = PaletteRegistry::with_builtins();
        let mut state = StreamAssemblyState::new(id, OutputMode::Video, 1);
        state.attach_initializer(initializer(id), &reg).unwrap();

        let good = sh.encode().unwrap();
        let (r, g) = frame(1, &good, good.len());
        // Header claims a hash over different content.
        let mut other = good.clone();
        other.push(true);
        let fh = FrameHeader::new(1, good.len() as u32, &other);
        let mut bits = fh.encode();
        bits.extend(&good);
        let pal = setup_palette();
        let colors = bits.iter().map(|b| pal.encode(b as u32)).collect();
        let bad = RenderJob { frame_number: 1, calibrator: false, colors }.render(g.grid, 2);

        let v = ingest(&mut state, &bad, g, &mut reg);
        assert_eq!(v, Verdict::Rejected(FrameFault::ContentHash));
        assert_eq!(state.phase(), Phase::AwaitingStreamHeader);
        assert!(!state.record_strike(&FrameFault::ContentHash));
        assert!(state.record_strike(&FrameFault::ContentHash));
        assert!(state.is_abandoned());

        assert_eq!(ingest(&mut state, &r, g, &mut reg), Verdict::Accepted);
        assert_eq!(state.phase(), Phase::PayloadIngest);
    }

    #[test]
    fn state_resumes_from_json() {
        let payload = vec![7u8; 40];
        let (sh, id) = stream_with_payload(&payload);
        let mut reg = PaletteRegistry::with_builtins();
        let mut state = StreamAssemblyState::new(id, OutputMode::Video, 5);
        state.attach_initializer(initializer(id), &reg).unwrap();
        let mut c1 = sh.encode().unwrap();
        c1.extend(&Bits::from_bytes(&payload[..20]));
        let (r1, g) = frame(1, &c1, c1.len());
        assert_eq!(ingest(&mut state, &r1, g, &mut reg), Verdict::Accepted);
        state.record_strike(&FrameFault::Truncated);

        let dir = tempfile::tempdir().unwrap();
        let path = state.path_in(dir.path());
        state.save(&path).unwrap();
        let mut resumed = StreamAssemblyState::load(&path).unwrap();
        assert_eq!(resumed.progress(), state.progress());
        assert_eq!(resumed.strikes(), 1);

        let c2 = Bits::from_bytes(&payload[20..]);
        let (r2, _) = frame(2, &c2, c2.len());
        assert_eq!(ingest(&mut resumed, &r2, g, &mut reg), Verdict::Accepted);
        assert_eq!(resumed.assemble().unwrap(), payload);
    }

    #[test]
    fn wrong_payload_hash_is_fatal() {
        let payload = b"data".to_vec();
        let (mut sh, _) = stream_with_payload(&payload);
        sh.total_frames = 1;
        let id = [9u8; 32];
        let mut reg = PaletteRegistry::with_builtins();
        let mut state = StreamAssemblyState::new(id, OutputMode::Image, 5);
        state.attach_initializer(initializer(id), &reg).unwrap();
        let mut c = sh.encode().unwrap();
        c.extend(&Bits::from_bytes(&payload));
        let (r, g) = frame(1, &c, c.len());
        assert_eq!(ingest(&mut state, &r, g, &mut reg), Verdict::Accepted);
        assert!(matches!(state.assemble(), Err(AssemblyError::PayloadHashMismatch(_))));
    }

    #[test]
    fn implausible_stream_size_is_a_strike() {
        let payload = b"data".to_vec();
        let (mut sh, id) = stream_with_payload(&payload);
        sh.size_bytes = u64::MAX / 4;
        sh.total_frames = 1;
        let mut reg = PaletteRegistry::with_builtins();
        let mut state = StreamAssemblyState::new(id, OutputMode::Image, 5);
        state.attach_initializer(initializer(id), &reg).unwrap();
        let mut c = sh.encode().unwrap();
        c.extend(&Bits::from_bytes(&payload));
        let (r, g) = frame(1, &c, c.len());
        assert!(matches!(ingest(&mut state, &r, g, &mut reg), Verdict::Rejected(FrameFault::Inconsistent(_))));
        assert!(state.stream_header().is_none());
        assert!(state.bitmap.is_empty());
    }

    #[test]
    fn declared_size_beyond_received_bits_is_a_mismatch() {
        let payload = b"data".to_vec();
        let (mut sh, id) = stream_with_payload(&payload);
        sh.size_bytes = 100;
        sh.total_frames = 1;
        let mut reg = PaletteRegistry::with_builtins();
        let mut state = StreamAssemblyState::new(id, OutputMode::Image, 5);
        state.attach_initializer(initializer(id), &reg).unwrap();
        let mut c = sh.encode().unwrap();
        c.extend(&Bits::from_bytes(&payload));
        let (r, g) = frame(1, &c, c.len());
        assert_eq!(ingest(&mut state, &r, g, &mut reg), Verdict::Accepted);
        assert!(state.is_complete());
        assert!(matches!(state.assemble(), Err(AssemblyError::PayloadHashMismatch(_))));
    }

    #[test]
    fn inconsistent_saved_state_fails_to_load() {
        let payload = vec![7u8; 40];
        let (sh, id) = stream_with_payload(&payload);
        let mut reg = PaletteRegistry::with_builtins();
        let mut state = StreamAssemblyState::new(id, OutputMode::Video, 5);
        state.attach_initializer(initializer(id), &reg).unwrap();
        let mut c1 = sh.encode().unwrap();
        c1.extend(&Bits::from_bytes(&payload[..20]));
        let (r1, g) = frame(1, &c1, c1.len());
        assert_eq!(ingest(&mut state, &r1, g, &mut reg), Verdict::Accepted);
        let saved: serde_json::Value = serde_json::from_slice(&state.to_json().unwrap()).unwrap();

        let mut slots = saved.clone();
        slots["bitmap"]["slots"] = serde_json::json!([true]);
        let err = StreamAssemblyState::from_json(&serde_json::to_vec(&slots).unwrap()).unwrap_err();
        assert!(matches!(err, AssemblyError::CorruptState(_)));

        let mut short = saved.clone();
        short["frames"]["1"]["len"] = 4096.into();
        let err = StreamAssemblyState::from_json(&serde_json::to_vec(&short).unwrap()).unwrap_err();
        assert!(matches!(err, AssemblyError::Json(_)));

        let mut stray = saved;
        stray["frames"]["2"] = serde_json::json!({ "bytes": [0], "len": 3 });
        let err = StreamAssemblyState::from_json(&serde_json::to_vec(&stray).unwrap()).unwrap_err();
        assert!(matches!(err, AssemblyError::CorruptState(_)));
    }

    #[test]
    fn unknown_builtin_palette_is_fatal() {
        let id = [1u8; 32];
        let reg = PaletteRegistry::with_builtins();
        let mut state = StreamAssemblyState::new(id, OutputMode::Image, 5);
        let init = InitializerHeader::new(BlockGrid::new(40, 40).unwrap(), PaletteId::Builtin(200), id);
        assert!(matches!(
            state.attach_initializer(init, &reg),
            Err(AssemblyError::Palette(PaletteError::UnknownBuiltin(200)))
        ));
    }
}
