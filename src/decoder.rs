//! Stream decoder: frames in, payload bytes out.
//!
//! # Per frame
//! 1. Lock on (calibrator frames) or reuse the video lock.
//! 2. Read the initializer (calibrator frames) and the frame header, both in
//!    the setup palette.
//! 3. Hand the frame to its stream's [`StreamAssemblyState`].
//!
//! # Ordering
//! Setup-header frames must be consumed in order.  One that arrives early is
//! parked and replayed once its predecessor is accepted.  Once a stream is in
//! payload ingest its frames are batched and decoded in parallel (feature
//! `parallel`); the strike counter and completion bitmap are atomic, and the
//! decoded bits are merged afterwards on the calling thread.
//!
//! # Strikes
//! Bad frames count against their own stream.  A stream past its limit is
//! abandoned: later frames for it are ignored and [`Decoder::assemble`]
//! reports the abandonment, while other streams in the source keep decoding.
//!
//! # Post-processing
//! An assembled stream is decrypted (if flagged) and decompressed (if
//! flagged) before it is returned.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::assembly::{state_path, AssemblyError, FrameFault, Phase, StreamAssemblyState, StreamProgress, Verdict};
use crate::bits::Bits;
use crate::codec::{get_codec, CodecError, CodecId};
use crate::config::{ConfigError, DecodeOptions, OutputMode};
use crate::crypto;
use crate::geometry::{lock_on, FrameGeometry, GeometryError, Raster};
use crate::header::{FrameHeader, InitializerHeader, StreamMetadata, FRAME_HEADER_BITS, INITIALIZER_BITS};
use crate::media::{FrameSource, MediaError};
use crate::palette::{setup_palette, PaletteId, PaletteRegistry};
use crate::scanner::FrameScanner;

pub type StreamId = [u8; 32];

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid options: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("Frame input error: {0}")]
    Media(#[from] MediaError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Unknown stream {0}")]
    UnknownStream(String),
    #[error("Stream is encrypted; a password is required")]
    PasswordRequired,
    #[error("Payload decryption failed (wrong password?)")]
    DecryptionFailed,
}

// ── Abort ────────────────────────────────────────────────────────────────────

/// Cooperative cancellation shared with other threads.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

// ── Reports ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum FrameVerdict {
    Accepted { stream: StreamId, frame_number: u32 },
    /// Already have this frame; a strike when duplicates are counted.
    Duplicate { stream: StreamId, frame_number: u32 },
    /// Parked until an earlier setup frame arrives.
    Deferred { stream: StreamId, frame_number: u32 },
    /// Bad frame; a strike against `stream` when it could be attributed.
    Rejected { stream: Option<StreamId>, fault: FrameFault },
    /// Bad frame that pushed `stream` past its strike limit.  Other streams
    /// in the source keep decoding.
    Abandoned { stream: StreamId, fault: FrameFault },
    /// The stream was already abandoned.
    Ignored { stream: StreamId },
    /// Not examined because decoding was aborted.
    Skipped,
}

/// Counts for one decode run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeReport {
    pub frames_seen: usize,
    pub accepted:    usize,
    pub duplicates:  usize,
    pub deferred:    usize,
    pub rejected:    usize,
    pub ignored:     usize,
    /// Streams given up during this run, in the order they failed.
    pub abandoned:   Vec<StreamId>,
    pub aborted:     bool,
}

impl DecodeReport {
    fn record(&mut self, v: &FrameVerdict) {
        match v {
            FrameVerdict::Accepted { .. } => self.accepted += 1,
            FrameVerdict::Duplicate { .. } => self.duplicates += 1,
            FrameVerdict::Deferred { .. } => self.deferred += 1,
            FrameVerdict::Rejected { .. } => self.rejected += 1,
            FrameVerdict::Abandoned { stream, .. } => {
                self.rejected += 1;
                if !self.abandoned.contains(stream) {
                    self.abandoned.push(*stream);
                }
            }
            FrameVerdict::Ignored { .. } | FrameVerdict::Skipped => self.ignored += 1,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Frames: {} seen, {} accepted, {} duplicate, {} deferred, {} rejected, {} ignored{}{}",
            self.frames_seen,
            self.accepted,
            self.duplicates,
            self.deferred,
            self.rejected,
            self.ignored,
            match self.abandoned.len() {
                0 => String::new(),
                n => format!(", {n} stream(s) abandoned"),
            },
            if self.aborted { " (aborted)" } else { "" },
        )
    }
}

/// A fully reassembled and post-processed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStream {
    pub stream_id: StreamId,
    pub palette:   Option<PaletteId>,
    pub metadata:  Option<StreamMetadata>,
    pub payload:   Vec<u8>,
}

// ── Internals ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct VideoLock {
    stream:   StreamId,
    geometry: FrameGeometry,
    width:    u32,
    height:   u32,
}

struct Prelude<'r> {
    scanner:     FrameScanner<'r>,
    stream:      StreamId,
    initializer: Option<InitializerHeader>,
    header:      FrameHeader,
}

enum PreludeError {
    Fault { stream: Option<StreamId>, fault: FrameFault },
    Fatal(DecodeError),
}

enum BatchOutcome {
    Stored { stream: StreamId, frame_number: u32, bits: Bits },
    Done(FrameVerdict),
    Abandoned { stream: StreamId, fault: FrameFault },
    Sequential,
}

struct Parked {
    frame_number: u32,
    raster:       Raster,
    calibrator:   bool,
}

// ── Decoder ──────────────────────────────────────────────────────────────────

pub struct Decoder {
    options:        DecodeOptions,
    registry:       PaletteRegistry,
    streams:        HashMap<StreamId, StreamAssemblyState>,
    parked:         HashMap<StreamId, Vec<Parked>>,
    video:          Option<VideoLock>,
    video_position: u64,
    abort:          AbortSignal,
    report:         DecodeReport,
}

impl Decoder {
    pub fn new(options: DecodeOptions, registry: PaletteRegistry) -> Result<Self, DecodeError> {
        options.validate()?;
        Ok(Self {
            options,
            registry,
            streams: HashMap::new(),
            parked: HashMap::new(),
            video: None,
            video_position: 0,
            abort: AbortSignal::new(),
            report: DecodeReport::default(),
        })
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    pub fn registry(&self) -> &PaletteRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PaletteRegistry {
        &mut self.registry
    }

    /// Handle for stopping an ingest from another thread.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn report(&self) -> &DecodeReport {
        &self.report
    }

    pub fn stream(&self, id: &StreamId) -> Option<&StreamAssemblyState> {
        self.streams.get(id)
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.streams.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn progress(&self) -> Vec<StreamProgress> {
        let mut p: Vec<_> = self.streams.values().map(|s| s.progress()).collect();
        p.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        p
    }

    /// Streams whose every frame is in.
    pub fn complete_streams(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.streams.iter().filter(|(_, s)| s.is_complete()).map(|(id, _)| *id).collect();
        ids.sort();
        ids
    }

    // ── Resumption ───────────────────────────────────────────────────────────

    /// Resume a previously saved stream.
    pub fn attach(&mut self, state: StreamAssemblyState) -> Result<(), DecodeError> {
        if let Some(p) = state.palette() {
            if p.is_custom() {
                self.registry.insert_custom(p.clone()).map_err(AssemblyError::from)?;
            }
        }
        info!(stream = %state.stream_id_hex(), phase = ?state.phase(), "stream attached");
        self.streams.insert(*state.stream_id(), state);
        Ok(())
    }

    pub fn detach(&mut self, id: &StreamId) -> Option<StreamAssemblyState> {
        self.parked.remove(id);
        self.streams.remove(id)
    }

    /// Write every in-progress stream to `<dir>/<hex id>.json`.
    pub fn save_states(&self, dir: &Path) -> Result<Vec<PathBuf>, DecodeError> {
        fs::create_dir_all(dir).map_err(AssemblyError::from)?;
        let mut paths = Vec::new();
        for (id, state) in &self.streams {
            let path = state_path(dir, id);
            state.save(&path)?;
            paths.push(path);
        }
        paths.sort();
        Ok(paths)
    }

    /// Attach every saved state found in `dir`.
    pub fn load_states(&mut self, dir: &Path) -> Result<usize, DecodeError> {
        let mut n = 0;
        for entry in fs::read_dir(dir).map_err(AssemblyError::from)? {
            let path = entry.map_err(AssemblyError::from)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            self.attach(StreamAssemblyState::load(&path)?)?;
            n += 1;
        }
        Ok(n)
    }

    // ── Ingest ───────────────────────────────────────────────────────────────

    /// Treat the next video frame as the calibrator frame of a new pass.
    pub fn begin_pass(&mut self) {
        self.video_position = 0;
    }

    fn next_is_calibrator(&mut self) -> bool {
        let cal = self.options.mode == OutputMode::Image || self.video_position == 0;
        self.video_position += 1;
        cal
    }

    /// Decode one frame on the calling thread.
    pub fn ingest_frame(&mut self, raster: Raster) -> Result<FrameVerdict, DecodeError> {
        self.report.frames_seen += 1;
        let calibrator = self.next_is_calibrator();
        self.ingest_sequential(raster, calibrator)
    }

    /// Drain a frame source.  Each call is a new pass (video frame 1 first).
    pub fn ingest_source(&mut self, source: &mut dyn FrameSource) -> Result<DecodeReport, DecodeError> {
        self.begin_pass();
        self.report = DecodeReport::default();
        let mut batch: Vec<(Raster, bool)> = Vec::with_capacity(self.options.batch_size);

        loop {
            // Checked before pulling so an abort never consumes a frame.
            if self.abort.is_aborted() {
                self.report.aborted = true;
                break;
            }
            let Some(next) = source.next_frame() else { break };
            let raster = next?;
            self.report.frames_seen += 1;
            let calibrator = self.next_is_calibrator();
            if self.parallel_ready(calibrator) {
                batch.push((raster, calibrator));
                if batch.len() >= self.options.batch_size {
                    self.flush_batch(&mut batch)?;
                }
            } else {
                self.flush_batch(&mut batch)?;
                self.ingest_sequential(raster, calibrator)?;
            }
        }
        self.flush_batch(&mut batch)?;
        if self.abort.is_aborted() {
            self.report.aborted = true;
        }
        info!("{}", self.report.summary());
        Ok(self.report.clone())
    }

    fn parallel_ready(&self, calibrator: bool) -> bool {
        if !self.options.parallel {
            return false;
        }
        match self.options.mode {
            OutputMode::Video => {
                !calibrator
                    && self
                        .video
                        .and_then(|v| self.streams.get(&v.stream))
                        .is_some_and(|s| s.phase() == Phase::PayloadIngest)
            }
            OutputMode::Image => self.streams.values().any(|s| s.phase() == Phase::PayloadIngest),
        }
    }

    fn ingest_sequential(&mut self, raster: Raster, calibrator: bool) -> Result<FrameVerdict, DecodeError> {
        let mut queue = VecDeque::from([(raster, calibrator)]);
        let mut first = None;
        while let Some((raster, calibrator)) = queue.pop_front() {
            let verdict = self.process(&raster, calibrator)?;
            self.report.record(&verdict);
            match &verdict {
                FrameVerdict::Deferred { stream, frame_number } => {
                    debug!(stream = %hex::encode(stream), frame = frame_number, "frame parked");
                    self.parked
                        .entry(*stream)
                        .or_default()
                        .push(Parked { frame_number: *frame_number, raster, calibrator });
                }
                FrameVerdict::Accepted { stream, .. } => self.release_parked(stream, &mut queue),
                FrameVerdict::Ignored { stream } | FrameVerdict::Abandoned { stream, .. } => {
                    self.parked.remove(stream);
                }
                _ => {}
            }
            first.get_or_insert(verdict);
        }
        Ok(first.unwrap_or(FrameVerdict::Skipped))
    }

    /// Requeue parked frames that can now make progress.
    fn release_parked(&mut self, stream: &StreamId, queue: &mut VecDeque<(Raster, bool)>) {
        let Some(state) = self.streams.get(stream) else { return };
        let Some(parked) = self.parked.get_mut(stream) else { return };
        let limit = state.next_setup_frame().unwrap_or(u32::MAX);
        let (ready, waiting): (Vec<_>, Vec<_>) = parked.drain(..).partition(|p| p.frame_number <= limit);
        *parked = waiting;
        for p in ready {
            queue.push_back((p.raster, p.calibrator));
        }
    }

    fn process(&mut self, raster: &Raster, calibrator: bool) -> Result<FrameVerdict, DecodeError> {
        let prelude = match self.read_prelude(raster, calibrator) {
            Ok(p) => p,
            Err(PreludeError::Fatal(e)) => return Err(e),
            Err(PreludeError::Fault { stream, fault }) => return Ok(self.strike(stream, fault)),
        };
        let Prelude { mut scanner, stream, initializer, header } = prelude;

        if !self.streams.contains_key(&stream) {
            let Some(init) = initializer.clone() else {
                return Ok(self.strike(None, FrameFault::Inconsistent("frame for an unknown stream".into())));
            };
            let mut state = StreamAssemblyState::new(stream, self.options.mode, self.options.strike_limit);
            state.attach_initializer(init, &self.registry)?;
            info!(stream = %state.stream_id_hex(), "new stream");
            self.streams.insert(stream, state);
        }
        if calibrator && self.options.mode == OutputMode::Video {
            self.video = Some(VideoLock {
                stream,
                geometry: *scanner.geometry(),
                width: raster.width(),
                height: raster.height(),
            });
        }

        let Some(state) = self.streams.get_mut(&stream) else {
            return Err(DecodeError::UnknownStream(hex::encode(stream)));
        };
        if state.is_abandoned() {
            return Ok(FrameVerdict::Ignored { stream });
        }
        if let (Some(seen), Some(known)) = (&initializer, state.initializer()) {
            if seen != known {
                let fault = FrameFault::Inconsistent("initializer disagrees with stream".into());
                return Ok(self.strike(Some(stream), fault));
            }
        }
        if state.phase() == Phase::AwaitingGeometry {
            if let Some(init) = initializer {
                state.attach_initializer(init, &self.registry)?;
            }
        }

        let n = header.frame_number;
        let outcome = match state.phase() {
            p if p.in_setup() => state.ingest_setup_frame(
                &mut scanner,
                &header,
                &mut self.registry,
                self.options.credentials.as_ref(),
            )?,
            Phase::PayloadIngest => match state.decode_payload_frame(&mut scanner, &header) {
                Ok(Some(bits)) => {
                    state.store_payload(n, bits);
                    Verdict::Accepted
                }
                Ok(None) => Verdict::Duplicate,
                Err(f) => Verdict::Rejected(f),
            },
            Phase::Assembled => Verdict::Duplicate,
            _ => Verdict::Rejected(FrameFault::Inconsistent("stream has no initializer".into())),
        };

        match outcome {
            Verdict::Accepted => {
                debug!(stream = %hex::encode(stream), frame = n, "frame accepted");
                Ok(FrameVerdict::Accepted { stream, frame_number: n })
            }
            Verdict::Duplicate => Ok(self.duplicate(stream, n)),
            Verdict::Deferred => Ok(FrameVerdict::Deferred { stream, frame_number: n }),
            Verdict::Rejected(f) => Ok(self.strike(Some(stream), f)),
        }
    }

    fn duplicate(&mut self, stream: StreamId, frame_number: u32) -> FrameVerdict {
        let fault = FrameFault::Duplicate(frame_number);
        if self.options.strike_duplicates && self.streams.get(&stream).is_some_and(|s| s.record_strike(&fault)) {
            self.parked.remove(&stream);
            return FrameVerdict::Abandoned { stream, fault };
        }
        FrameVerdict::Duplicate { stream, frame_number }
    }

    /// Charge a bad frame to its stream.  Crossing the limit abandons that
    /// stream only; its parked frames are dropped.
    fn strike(&mut self, stream: Option<StreamId>, fault: FrameFault) -> FrameVerdict {
        match stream.and_then(|id| self.streams.get(&id)) {
            Some(state) if state.record_strike(&fault) => {
                let id = *state.stream_id();
                self.parked.remove(&id);
                FrameVerdict::Abandoned { stream: id, fault }
            }
            Some(_) => FrameVerdict::Rejected { stream, fault },
            None => {
                warn!(%fault, "bad frame for no known stream");
                FrameVerdict::Rejected { stream, fault }
            }
        }
    }

    fn read_prelude<'r>(&self, raster: &'r Raster, calibrator: bool) -> Result<Prelude<'r>, PreludeError> {
        let setup = setup_palette();
        let video_stream = self.video.map(|v| v.stream);

        let (mut scanner, initializer) = if calibrator {
            let geometry = match lock_on(raster, self.options.grid) {
                Ok(g) => g,
                Err(e @ GeometryError::GeometryMismatch { .. }) => return Err(PreludeError::Fatal(e.into())),
                Err(e) => return Err(PreludeError::Fault { stream: None, fault: e.into() }),
            };
            let mut scanner = FrameScanner::new(raster, geometry, true);
            let fault = |fault: FrameFault| PreludeError::Fault { stream: None, fault };
            let bits = scanner.read_exact(INITIALIZER_BITS, &setup).ok_or_else(|| fault(FrameFault::Truncated))?;
            let init = InitializerHeader::decode(&bits).map_err(|e| fault(e.into()))?;
            if init.grid != geometry.grid {
                return Err(fault(FrameFault::Inconsistent("initializer grid disagrees with calibrator".into())));
            }
            (scanner, Some(init))
        } else {
            let Some(v) = self.video else {
                return Err(PreludeError::Fault {
                    stream: None,
                    fault:  FrameFault::Inconsistent("no calibrator frame seen yet".into()),
                });
            };
            if (raster.width(), raster.height()) != (v.width, v.height) {
                return Err(PreludeError::Fault {
                    stream: Some(v.stream),
                    fault:  FrameFault::Inconsistent("frame size changed mid-stream".into()),
                });
            }
            (FrameScanner::new(raster, v.geometry, false), None)
        };

        let stream = initializer.as_ref().map(|i| i.stream_id).or(video_stream);
        let fault = |fault: FrameFault| PreludeError::Fault { stream, fault };
        let Some(stream_id) = stream else {
            return Err(fault(FrameFault::Inconsistent("frame carries no stream id".into())));
        };
        let bits = scanner.read_exact(FRAME_HEADER_BITS, &setup).ok_or_else(|| fault(FrameFault::Truncated))?;
        let header = FrameHeader::decode(&bits).map_err(|e| fault(e.into()))?;
        Ok(Prelude { scanner, stream: stream_id, initializer, header })
    }

    // ── Parallel payload ingest ──────────────────────────────────────────────

    fn flush_batch(&mut self, batch: &mut Vec<(Raster, bool)>) -> Result<(), DecodeError> {
        if batch.is_empty() {
            return Ok(());
        }
        let frames = std::mem::take(batch);
        let outcomes: Vec<BatchOutcome> = {
            let this = &*self;
            #[cfg(feature = "parallel")]
            {
                use rayon::prelude::*;
                frames.par_iter().map(|(r, cal)| this.decode_batched(r, *cal)).collect()
            }
            #[cfg(not(feature = "parallel"))]
            {
                frames.iter().map(|(r, cal)| this.decode_batched(r, *cal)).collect()
            }
        };

        let mut sequential = Vec::new();
        for ((raster, calibrator), outcome) in frames.into_iter().zip(outcomes) {
            let verdict = match outcome {
                BatchOutcome::Stored { stream, frame_number, bits } => {
                    if let Some(state) = self.streams.get_mut(&stream) {
                        state.store_payload(frame_number, bits);
                    }
                    FrameVerdict::Accepted { stream, frame_number }
                }
                BatchOutcome::Done(v) => v,
                BatchOutcome::Abandoned { stream, fault } => {
                    self.parked.remove(&stream);
                    FrameVerdict::Abandoned { stream, fault }
                }
                BatchOutcome::Sequential => {
                    sequential.push((raster, calibrator));
                    continue;
                }
            };
            self.report.record(&verdict);
        }
        if self.abort.is_aborted() {
            self.report.aborted = true;
            return Ok(());
        }
        for (raster, calibrator) in sequential {
            self.ingest_sequential(raster, calibrator)?;
        }
        Ok(())
    }

    fn decode_batched(&self, raster: &Raster, calibrator: bool) -> BatchOutcome {
        if self.abort.is_aborted() {
            return BatchOutcome::Done(FrameVerdict::Skipped);
        }
        let prelude = match self.read_prelude(raster, calibrator) {
            Ok(p) => p,
            Err(PreludeError::Fatal(_)) => return BatchOutcome::Sequential,
            Err(PreludeError::Fault { stream, fault }) => return self.strike_shared(stream, fault),
        };
        let Prelude { mut scanner, stream, initializer, header } = prelude;
        let Some(state) = self.streams.get(&stream) else {
            return BatchOutcome::Sequential;
        };
        if state.is_abandoned() {
            return BatchOutcome::Done(FrameVerdict::Ignored { stream });
        }
        if state.phase() != Phase::PayloadIngest {
            return BatchOutcome::Sequential;
        }
        if let (Some(seen), Some(known)) = (&initializer, state.initializer()) {
            if seen != known {
                let fault = FrameFault::Inconsistent("initializer disagrees with stream".into());
                return self.strike_shared(Some(stream), fault);
            }
        }
        let n = header.frame_number;
        match state.decode_payload_frame(&mut scanner, &header) {
            Ok(Some(bits)) => BatchOutcome::Stored { stream, frame_number: n, bits },
            Ok(None) if self.options.strike_duplicates && state.record_strike(&FrameFault::Duplicate(n)) => {
                BatchOutcome::Abandoned { stream, fault: FrameFault::Duplicate(n) }
            }
            Ok(None) => BatchOutcome::Done(FrameVerdict::Duplicate { stream, frame_number: n }),
            Err(f) => self.strike_shared(Some(stream), f),
        }
    }

    fn strike_shared(&self, stream: Option<StreamId>, fault: FrameFault) -> BatchOutcome {
        match stream.and_then(|id| self.streams.get(&id)) {
            Some(state) if state.record_strike(&fault) => {
                BatchOutcome::Abandoned { stream: *state.stream_id(), fault }
            }
            Some(_) => BatchOutcome::Done(FrameVerdict::Rejected { stream, fault }),
            None => {
                warn!(%fault, "bad frame for no known stream");
                BatchOutcome::Done(FrameVerdict::Rejected { stream, fault })
            }
        }
    }

    // ── Output ───────────────────────────────────────────────────────────────

    /// Assemble, decrypt and decompress a complete stream.  On success the
    /// stream's state is dropped.
    pub fn assemble(&mut self, id: &StreamId) -> Result<DecodedStream, DecodeError> {
        let state = self.streams.get_mut(id).ok_or_else(|| DecodeError::UnknownStream(hex::encode(id)))?;
        if state.is_abandoned() {
            return Err(state.abandoned_error().into());
        }
        let wire = state.assemble()?;
        let Some(sh) = state.stream_header().cloned() else {
            return Err(AssemblyError::Incomplete { missing: usize::MAX }.into());
        };

        let packed = if sh.encryption {
            let c = self.options.credentials.as_ref().ok_or(DecodeError::PasswordRequired)?;
            crypto::decrypt(&wire, &c.password, &c.cost).ok_or(DecodeError::DecryptionFailed)?
        } else {
            wire
        };
        let payload = get_codec(CodecId::from_flag(sh.compression)).decompress(&packed)?;

        if let Some(c) = &self.options.credentials {
            if state.metadata().is_none() {
                if let Err(e) = state.unlock_metadata(c) {
                    warn!(stream = %state.stream_id_hex(), error = %e, "metadata stays locked");
                }
            }
        }
        let decoded = DecodedStream {
            stream_id: *id,
            palette:   state.initializer().map(|i| i.palette_id),
            metadata:  state.metadata().cloned(),
            payload,
        };
        info!(stream = %hex::encode(id), bytes = decoded.payload.len(), "stream decoded");
        self.detach(id);
        Ok(decoded)
    }

    /// Assemble every complete stream.
    pub fn assemble_ready(&mut self) -> Vec<(StreamId, Result<DecodedStream, DecodeError>)> {
        self.complete_streams()
            .into_iter()
            .map(|id| {
                let r = self.assemble(&id);
                (id, r)
            })
            .collect()
    }
}
