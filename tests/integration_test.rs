use blockcast::assembly::AssemblyError;
use blockcast::decoder::DecodeError;
use blockcast::geometry::GeometryError;
use blockcast::header::ManifestEntry;
use blockcast::media::{FrameSink, FrameSource, MediaError};
use blockcast::{
    encode_stream, AbortSignal, encode_to_frames, BlockGrid, CostParams, Credentials, DecodeOptions, Decoder,
    EncodeOptions, Manifest, MemoryFrames, OutputMode, Palette, PaletteId, PaletteRegistry,
    PngDirectory, Raster,
};
use proptest::prelude::*;

/// Incompressible test data.
fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (x >> 33) as u8
        })
        .collect()
}

fn small(mode: OutputMode) -> EncodeOptions {
    EncodeOptions { pixel_width: 2, mode, compression: false, ..Default::default() }
}

fn decoder(mode: OutputMode) -> Decoder {
    Decoder::new(DecodeOptions { mode, ..Default::default() }, PaletteRegistry::with_builtins()).unwrap()
}

fn decode_one(d: &mut Decoder, frames: Vec<Raster>) -> Vec<u8> {
    d.ingest_source(&mut MemoryFrames::new(frames)).unwrap();
    let ids = d.complete_streams();
    assert_eq!(ids.len(), 1, "expected exactly one complete stream");
    d.assemble(&ids[0]).unwrap().payload
}

fn scribble(raster: &mut Raster) {
    let (w, h) = (raster.width(), raster.height());
    raster.fill_rect(0, h / 2, w, h, [128, 128, 128]);
}

/// Damage content but leave the calibrator column, so image frames still
/// lock on and are charged to their stream.
fn smudge(raster: &mut Raster, pixel_width: u32) {
    let (w, h) = (raster.width(), raster.height());
    raster.fill_rect(2 * pixel_width, h / 2, w, h, [128, 128, 128]);
}

/// Raises the abort signal while handing out frame `after + 1`.
struct AbortAfter {
    frames: MemoryFrames,
    signal: AbortSignal,
    after:  usize,
}

impl FrameSource for AbortAfter {
    fn next_frame(&mut self) -> Option<Result<Raster, MediaError>> {
        if self.after == 0 {
            self.signal.abort();
        }
        self.after = self.after.saturating_sub(1);
        self.frames.next_frame()
    }
}

#[test]
fn test_video_roundtrip() {
    let reg = PaletteRegistry::with_builtins();
    let data = noise(6000, 1);
    let opts = EncodeOptions { stream_name: "noise.bin".into(), ..small(OutputMode::Video) };
    let (frames, report) = encode_to_frames(&data, &opts, &reg).unwrap();
    assert!(report.total_frames > 3);

    let mut d = decoder(OutputMode::Video);
    d.ingest_source(&mut MemoryFrames::new(frames)).unwrap();
    let id = report.stream_id;
    assert!(d.stream(&id).unwrap().is_complete());
    let out = d.assemble(&id).unwrap();
    assert_eq!(out.payload, data);
    assert_eq!(out.palette, Some(PaletteId::Builtin(2)));
    assert_eq!(out.metadata.unwrap().stream_name, "noise.bin");
    assert!(d.stream(&id).is_none());
}

#[test]
fn test_compressed_image_roundtrip() {
    let reg = PaletteRegistry::with_builtins();
    let data = b"compressible text, ".repeat(400);
    let opts = EncodeOptions { compression: true, ..small(OutputMode::Image) };
    let (frames, report) = encode_to_frames(&data, &opts, &reg).unwrap();
    assert!(report.wire_bytes < data.len() as u64);
    assert_eq!(decode_one(&mut decoder(OutputMode::Image), frames), data);
}

#[test]
fn test_every_builtin_indexed_palette() {
    let reg = PaletteRegistry::with_builtins();
    let data = noise(1500, 2);
    for id in 1..=5u8 {
        let opts = EncodeOptions { palette: PaletteId::Builtin(id), ..small(OutputMode::Video) };
        let (frames, _) = encode_to_frames(&data, &opts, &reg).unwrap();
        assert_eq!(decode_one(&mut decoder(OutputMode::Video), frames), data, "palette {id}");
    }
}

#[test]
fn test_direct24_images() {
    let reg = PaletteRegistry::with_builtins();
    let data = noise(900, 3);
    let opts = EncodeOptions { palette: PaletteId::Builtin(6), ..small(OutputMode::Image) };
    let (frames, _) = encode_to_frames(&data, &opts, &reg).unwrap();
    assert_eq!(decode_one(&mut decoder(OutputMode::Image), frames), data);
}

#[test]
fn test_custom_palette_learned_from_stream() {
    let custom = Palette::custom(
        "four",
        "high contrast",
        1_700_000_000,
        vec![[0, 0, 0], [255, 255, 255], [255, 0, 0], [0, 0, 255]],
    )
    .unwrap();
    let id = custom.id;
    let mut enc_reg = PaletteRegistry::with_builtins();
    enc_reg.insert_custom(custom).unwrap();

    let data = noise(2500, 4);
    let opts = EncodeOptions { palette: id, ..small(OutputMode::Video) };
    let (frames, _) = encode_to_frames(&data, &opts, &enc_reg).unwrap();

    let mut d = decoder(OutputMode::Video);
    assert!(!d.registry().contains(id));
    d.ingest_source(&mut MemoryFrames::new(frames)).unwrap();
    assert!(d.registry().contains(id));
    let stream = d.complete_streams()[0];
    let out = d.assemble(&stream).unwrap();
    assert_eq!(out.payload, data);
    assert_eq!(out.palette, Some(id));
}

#[test]
fn test_encrypted_stream_with_masked_metadata() {
    let reg = PaletteRegistry::with_builtins();
    let creds = Credentials::new("hunter2", CostParams::insecure_fast());
    let data = noise(3000, 5);
    let opts = EncodeOptions {
        credentials: Some(creds.clone()),
        mask_metadata: true,
        stream_name: "private".into(),
        manifest: Manifest::single_file("private.bin", &data),
        ..small(OutputMode::Video)
    };
    let (frames, report) = encode_to_frames(&data, &opts, &reg).unwrap();
    assert!(report.encrypted);

    // No password: frames verify, metadata stays locked, payload cannot be opened.
    let mut locked = decoder(OutputMode::Video);
    locked.ingest_source(&mut MemoryFrames::new(frames.clone())).unwrap();
    let progress = locked.progress();
    assert!(progress[0].metadata_locked);
    assert!(matches!(locked.assemble(&report.stream_id), Err(DecodeError::PasswordRequired)));

    let wrong = DecodeOptions {
        credentials: Some(Credentials::new("nope", CostParams::insecure_fast())),
        ..Default::default()
    };
    let mut d = Decoder::new(wrong, PaletteRegistry::with_builtins()).unwrap();
    d.ingest_source(&mut MemoryFrames::new(frames.clone())).unwrap();
    assert!(matches!(d.assemble(&report.stream_id), Err(DecodeError::DecryptionFailed)));

    let right = DecodeOptions { credentials: Some(creds), ..Default::default() };
    let mut d = Decoder::new(right, PaletteRegistry::with_builtins()).unwrap();
    d.ingest_source(&mut MemoryFrames::new(frames)).unwrap();
    let out = d.assemble(&report.stream_id).unwrap();
    assert_eq!(out.payload, data);
    let meta = out.metadata.unwrap();
    assert_eq!(meta.stream_name, "private");
    assert_eq!(meta.manifest.entries[0], ManifestEntry::file("private.bin", &data));
}

#[test]
fn test_setup_headers_span_frames() {
    let reg = PaletteRegistry::with_builtins();
    let data = noise(400, 6);
    let opts = EncodeOptions {
        grid: BlockGrid::new(31, 33).unwrap(),
        stream_name: "a rather long stream name that makes the metadata header bigger".into(),
        stream_description: "x".repeat(200),
        ..small(OutputMode::Video)
    };
    let (frames, report) = encode_to_frames(&data, &opts, &reg).unwrap();
    assert!(report.total_frames >= 3);
    assert_eq!(decode_one(&mut decoder(OutputMode::Video), frames), data);
}

#[test]
fn test_out_of_order_images() {
    let reg = PaletteRegistry::with_builtins();
    let data = noise(3000, 7);
    let (mut frames, report) = encode_to_frames(&data, &small(OutputMode::Image), &reg).unwrap();
    assert!(report.total_frames > 2);
    frames.reverse();

    let mut d = decoder(OutputMode::Image);
    let r = d.ingest_source(&mut MemoryFrames::new(frames)).unwrap();
    assert!(r.deferred > 0);
    assert_eq!(r.rejected, 0);
    assert_eq!(d.assemble(&report.stream_id).unwrap().payload, data);
}

#[test]
fn test_interleaved_image_streams() {
    let reg = PaletteRegistry::with_builtins();
    let a = noise(2000, 8);
    let b = noise(2600, 9);
    let (fa, ra) = encode_to_frames(&a, &small(OutputMode::Image), &reg).unwrap();
    let (fb, rb) = encode_to_frames(&b, &small(OutputMode::Image), &reg).unwrap();

    let mut mixed = Vec::new();
    let (mut ia, mut ib) = (fa.into_iter(), fb.into_iter());
    loop {
        match (ia.next(), ib.next()) {
            (None, None) => break,
            (x, y) => mixed.extend(x.into_iter().chain(y)),
        }
    }

    let mut d = decoder(OutputMode::Image);
    d.ingest_source(&mut MemoryFrames::new(mixed)).unwrap();
    let mut results = d.assemble_ready();
    assert_eq!(results.len(), 2);
    results.sort_by_key(|(id, _)| *id != ra.stream_id);
    assert_eq!(results[0].1.as_ref().unwrap().payload, a);
    assert_eq!(results[1].0, rb.stream_id);
    assert_eq!(results[1].1.as_ref().unwrap().payload, b);
}

#[test]
fn test_duplicate_frames() {
    let reg = PaletteRegistry::with_builtins();
    let data = noise(5000, 10);
    let (frames, report) = encode_to_frames(&data, &small(OutputMode::Video), &reg).unwrap();
    let mut replayed = frames.clone();
    replayed.extend(frames[2..5].iter().cloned());

    for parallel in [true, false] {
        for strike_duplicates in [true, false] {
            let opts = DecodeOptions { parallel, strike_duplicates, ..Default::default() };
            let mut d = Decoder::new(opts, PaletteRegistry::with_builtins()).unwrap();
            let r = d.ingest_source(&mut MemoryFrames::new(replayed.clone())).unwrap();
            assert_eq!(r.duplicates, 3);
            assert_eq!(r.rejected, 0);
            let strikes = d.stream(&report.stream_id).unwrap().strikes();
            assert_eq!(strikes, if strike_duplicates { 3 } else { 0 });
            assert_eq!(d.assemble(&report.stream_id).unwrap().payload, data);
        }
    }
}

#[test]
fn test_bad_frames_within_strike_limit() {
    let reg = PaletteRegistry::with_builtins();
    let data = noise(16 * 1024, 11);
    let (frames, report) = encode_to_frames(&data, &small(OutputMode::Video), &reg).unwrap();
    assert!(report.total_frames >= 15);

    let bad = [3usize, 6, 9, 12];
    let mut damaged = frames.clone();
    for &i in &bad {
        scribble(&mut damaged[i]);
    }
    let opts = DecodeOptions { strike_limit: 5, ..Default::default() };
    let mut d = Decoder::new(opts, PaletteRegistry::with_builtins()).unwrap();
    let r = d.ingest_source(&mut MemoryFrames::new(damaged)).unwrap();
    assert_eq!(r.rejected, 4);
    let state = d.stream(&report.stream_id).unwrap();
    assert_eq!(state.strikes(), 4);
    assert!(!state.is_complete());
    assert!(matches!(
        d.assemble(&report.stream_id),
        Err(DecodeError::Assembly(AssemblyError::Incomplete { missing: 4 }))
    ));

    // A second pass over the whole clean stream fills the gaps; frames
    // already held are skipped without a strike.
    let r = d.ingest_source(&mut MemoryFrames::new(frames.clone())).unwrap();
    assert_eq!(r.accepted, bad.len());
    assert_eq!(r.duplicates, frames.len() - bad.len());
    assert!(r.abandoned.is_empty());
    assert_eq!(d.stream(&report.stream_id).unwrap().strikes(), 4);
    assert_eq!(d.assemble(&report.stream_id).unwrap().payload, data);
}

#[test]
fn test_too_many_bad_frames_abandons_stream() {
    let reg = PaletteRegistry::with_builtins();
    let data = noise(16 * 1024, 12);
    let (mut frames, report) = encode_to_frames(&data, &small(OutputMode::Video), &reg).unwrap();
    for i in 2..8 {
        scribble(&mut frames[i]);
    }
    let opts = DecodeOptions { strike_limit: 5, ..Default::default() };
    let mut d = Decoder::new(opts, PaletteRegistry::with_builtins()).unwrap();
    let r = d.ingest_source(&mut MemoryFrames::new(frames)).unwrap();
    assert_eq!(r.abandoned, vec![report.stream_id]);
    assert_eq!(r.rejected, 6);
    assert!(d.stream(&report.stream_id).unwrap().is_abandoned());
    assert!(matches!(
        d.assemble(&report.stream_id),
        Err(DecodeError::Assembly(AssemblyError::StreamAbandoned { limit: 5, .. }))
    ));
}

#[test]
fn test_abandoned_stream_leaves_others_decoding() {
    let reg = PaletteRegistry::with_builtins();
    let a = noise(6000, 20);
    let b = noise(1500, 21);
    let (mut frames, ra) = encode_to_frames(&a, &small(OutputMode::Image), &reg).unwrap();
    let (fb, rb) = encode_to_frames(&b, &small(OutputMode::Image), &reg).unwrap();
    let n = frames.len();
    assert!(n >= 7);
    for f in &mut frames[n - 6..] {
        smudge(f, 2);
    }
    frames.extend(fb);

    let opts = DecodeOptions { mode: OutputMode::Image, strike_limit: 5, ..Default::default() };
    let mut d = Decoder::new(opts, PaletteRegistry::with_builtins()).unwrap();
    let r = d.ingest_source(&mut MemoryFrames::new(frames)).unwrap();
    assert_eq!(r.abandoned, vec![ra.stream_id]);
    assert_eq!(r.rejected, 6);
    assert_eq!(d.complete_streams(), vec![rb.stream_id]);
    assert_eq!(d.assemble(&rb.stream_id).unwrap().payload, b);
    assert!(matches!(
        d.assemble(&ra.stream_id),
        Err(DecodeError::Assembly(AssemblyError::StreamAbandoned { strikes: 6, limit: 5, .. }))
    ));
}

#[test]
fn test_resume_from_saved_state() {
    let dir = tempfile::tempdir().unwrap();
    let reg = PaletteRegistry::with_builtins();
    let data = noise(8000, 13);
    let (frames, report) = encode_to_frames(&data, &small(OutputMode::Video), &reg).unwrap();
    let half = frames.len() / 2;

    {
        let mut d = decoder(OutputMode::Video);
        d.ingest_source(&mut MemoryFrames::new(frames[..half].to_vec())).unwrap();
        let saved = d.save_states(dir.path()).unwrap();
        assert_eq!(saved.len(), 1);
    }

    let mut d = decoder(OutputMode::Video);
    assert_eq!(d.load_states(dir.path()).unwrap(), 1);
    assert_eq!(d.progress()[0].frames_complete, half);

    let mut rest = vec![frames[0].clone()];
    rest.extend(frames[half..].iter().cloned());
    let r = d.ingest_source(&mut MemoryFrames::new(rest)).unwrap();
    assert_eq!(r.duplicates, 1);
    assert_eq!(d.assemble(&report.stream_id).unwrap().payload, data);
}

#[test]
fn test_png_directory_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let reg = PaletteRegistry::with_builtins();
    let data = noise(3500, 14);

    let mut sink = PngDirectory::create(dir.path()).unwrap();
    let report = encode_stream(&data, &small(OutputMode::Video), &reg, &mut sink).unwrap();
    assert_eq!(sink.frames_written(), report.total_frames);

    let mut d = decoder(OutputMode::Video);
    d.ingest_source(&mut PngDirectory::open(dir.path()).unwrap()).unwrap();
    assert_eq!(d.assemble(&report.stream_id).unwrap().payload, data);
}

#[test]
fn test_known_grid_mismatch_is_fatal() {
    let reg = PaletteRegistry::with_builtins();
    let (frames, _) = encode_to_frames(&noise(500, 15), &small(OutputMode::Video), &reg).unwrap();
    let opts = DecodeOptions { grid: Some(BlockGrid::new(40, 70).unwrap()), ..Default::default() };
    let mut d = Decoder::new(opts, PaletteRegistry::with_builtins()).unwrap();
    let err = d.ingest_source(&mut MemoryFrames::new(frames)).unwrap_err();
    assert!(matches!(err, DecodeError::Geometry(GeometryError::GeometryMismatch { .. })));
}

#[test]
fn test_abort_stops_ingest() {
    let reg = PaletteRegistry::with_builtins();
    let (frames, _) = encode_to_frames(&noise(4000, 16), &small(OutputMode::Video), &reg).unwrap();
    let n = frames.len();
    let mut d = decoder(OutputMode::Video);
    d.abort_signal().abort();
    let mut source = MemoryFrames::new(frames);
    let r = d.ingest_source(&mut source).unwrap();
    assert!(r.aborted);
    assert_eq!(r.accepted, 0);
    assert_eq!(r.frames_seen, 0);
    assert_eq!(source.len(), n);
    assert!(d.stream_ids().is_empty());
}

#[test]
fn test_abort_mid_ingest_leaves_unread_frames() {
    let reg = PaletteRegistry::with_builtins();
    let (frames, _) = encode_to_frames(&noise(4000, 19), &small(OutputMode::Video), &reg).unwrap();
    let n = frames.len();
    assert!(n > 3);
    let opts = DecodeOptions { parallel: false, ..Default::default() };
    let mut d = Decoder::new(opts, PaletteRegistry::with_builtins()).unwrap();
    let mut source = AbortAfter { frames: MemoryFrames::new(frames), signal: d.abort_signal(), after: 2 };
    let r = d.ingest_source(&mut source).unwrap();
    assert!(r.aborted);
    assert_eq!(r.frames_seen, 3);
    assert_eq!(source.frames.len(), n - 3);
}

#[test]
fn test_memory_sink_collects_frames() {
    let reg = PaletteRegistry::with_builtins();
    let mut sink = MemoryFrames::default();
    let report = encode_stream(b"hello", &small(OutputMode::Image), &reg, &mut sink).unwrap();
    sink.finish().unwrap();
    assert_eq!(sink.len() as u32, report.total_frames);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_image_roundtrip(data in proptest::collection::vec(any::<u8>(), 1..1200)) {
        let reg = PaletteRegistry::with_builtins();
        let (frames, _) = encode_to_frames(&data, &small(OutputMode::Image), &reg).unwrap();
        prop_assert_eq!(decode_one(&mut decoder(OutputMode::Image), frames), data);
    }
}
