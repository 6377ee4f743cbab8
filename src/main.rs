use clap::{Parser, Subcommand};
use blockcast::config::{DEFAULT_BATCH_SIZE, DEFAULT_STRIKE_LIMIT};
use blockcast::crypto::{CostParams, Credentials};
use blockcast::media::read_png;
use blockcast::{
    encode_stream, BlockGrid, DecodeOptions, Decoder, EncodeOptions, Manifest, OutputMode, Palette,
    PaletteId, PaletteRegistry, PngDirectory,
};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blockcast", about = "Color-block frame transport CLI")]
struct Cli {
    /// Log more (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a file into a directory of PNG frames
    Encode {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Built-in id (1-6), custom palette hex id, or nickname
        #[arg(short = 'P', long, default_value = "2")]
        palette: String,
        /// Load custom palettes from JSON files
        #[arg(long)]
        palette_file: Vec<PathBuf>,
        #[arg(long, default_value = "45")]
        block_height: u16,
        #[arg(long, default_value = "80")]
        block_width: u16,
        /// Block edge in pixels
        #[arg(long, default_value = "8")]
        pixel_width: u32,
        #[arg(short, long, value_enum, default_value = "video")]
        mode: OutputMode,
        #[arg(long)]
        no_compress: bool,
        /// Zstd level 1-19
        #[arg(short, long, default_value = "3")]
        level: i32,
        /// Encrypt with AES-256-GCM (Argon2id key derivation)
        #[arg(short, long)]
        password: Option<String>,
        /// Also encrypt the metadata header
        #[arg(long)]
        mask: bool,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Decode a directory of PNG frames
    Decode {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        #[arg(short, long, value_enum, default_value = "video")]
        mode: OutputMode,
        #[arg(long)]
        palette_file: Vec<PathBuf>,
        /// Known grid as HEIGHTxWIDTH; skips discovery
        #[arg(long)]
        grid: Option<String>,
        #[arg(long, default_value_t = DEFAULT_STRIKE_LIMIT)]
        strike_limit: u32,
        /// Count repeated frames as strikes
        #[arg(long)]
        strike_duplicates: bool,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        #[arg(long)]
        sequential: bool,
        #[arg(short, long)]
        password: Option<String>,
        /// Resume from and save partial progress to this directory
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// List built-in and loaded custom palettes
    Palettes {
        #[arg(long)]
        palette_file: Vec<PathBuf>,
    },
    /// Detect the block grid of a single frame
    LockOn {
        frame: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    match cli.command {

        // ── Encode ───────────────────────────────────────────────────────────
        Commands::Encode {
            input, output, palette, palette_file, block_height, block_width, pixel_width,
            mode, no_compress, level, password, mask, name, description,
        } => {
            let registry = load_registry(&palette_file)?;
            let data = std::fs::read(&input)?;
            let file_name = input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "payload".into());
            let opts = EncodeOptions {
                palette: resolve_palette(&registry, &palette)?,
                grid: BlockGrid { block_height, block_width },
                pixel_width,
                mode,
                compression: !no_compress,
                compression_level: level,
                credentials: password.map(|p| Credentials::new(p, CostParams::default())),
                mask_metadata: mask,
                stream_name: if name.is_empty() { file_name.clone() } else { name },
                stream_description: description,
                manifest: Manifest::single_file(file_name, &data),
            };
            let mut sink = PngDirectory::create(&output)?;
            let report = encode_stream(&data, &opts, &registry, &mut sink)?;
            println!("{}", report.summary());
            println!("Frames written to: {}", output.display());
        }

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode {
            input, output_dir, mode, palette_file, grid, strike_limit, strike_duplicates,
            batch_size, sequential, password, state_dir,
        } => {
            let registry = load_registry(&palette_file)?;
            let opts = DecodeOptions {
                mode,
                strike_limit,
                strike_duplicates,
                grid: grid.as_deref().map(parse_grid).transpose()?,
                credentials: password.map(|p| Credentials::new(p, CostParams::default())),
                parallel: !sequential,
                batch_size,
            };
            let mut decoder = Decoder::new(opts, registry)?;
            if let Some(dir) = &state_dir {
                if dir.is_dir() {
                    let n = decoder.load_states(dir)?;
                    println!("Resumed {n} stream(s) from {}", dir.display());
                }
            }

            let mut source = PngDirectory::open(&input)?;
            let report = decoder.ingest_source(&mut source)?;
            println!("{}", report.summary());
            for state in report.abandoned.iter().filter_map(|id| decoder.stream(id)) {
                eprintln!("  stream {} failed: {}", state.stream_id_hex(), state.abandoned_error());
            }

            std::fs::create_dir_all(&output_dir)?;
            for (id, result) in decoder.assemble_ready() {
                match result {
                    Ok(stream) => {
                        let name = stream
                            .metadata
                            .as_ref()
                            .and_then(|m| m.manifest.entries.first())
                            .filter(|e| !e.is_directory())
                            .map(|e| e.name.clone())
                            .unwrap_or_else(|| format!("{}.bin", hex::encode(id)));
                        let path = output_dir.join(sanitize(&name));
                        std::fs::write(&path, &stream.payload)?;
                        println!("  decoded  {} ({} bytes)", path.display(), stream.payload.len());
                    }
                    Err(e) => eprintln!("  stream {} failed: {e}", hex::encode(id)),
                }
            }
            for p in decoder.progress() {
                println!(
                    "  pending  {}  {:?}  {}/{} frames  {} strike(s)",
                    p.stream_id,
                    p.phase,
                    p.frames_complete,
                    p.total_frames.map_or_else(|| "?".into(), |t| t.to_string()),
                    p.strikes,
                );
            }
            if let Some(dir) = &state_dir {
                let saved = decoder.save_states(dir)?;
                if !saved.is_empty() {
                    println!("Saved {} partial stream(s) to {}", saved.len(), dir.display());
                }
            }
        }

        // ── Palettes ─────────────────────────────────────────────────────────
        Commands::Palettes { palette_file } => {
            let registry = load_registry(&palette_file)?;
            println!("{:<66} {:>4} {:>8}  Name", "Id", "Bits", "MinDist");
            for p in registry.list() {
                println!(
                    "{:<66} {:>4} {:>8.1}  {}{}",
                    p.id.to_string(),
                    p.bit_length(),
                    p.min_distance,
                    p.name,
                    p.nickname.as_ref().map(|n| format!(" ({n})")).unwrap_or_default(),
                );
            }
        }

        // ── Lock-on ──────────────────────────────────────────────────────────
        Commands::LockOn { frame } => {
            let raster = read_png(&frame)?;
            let g = blockcast::lock_on(&raster, None)?;
            println!("── Frame geometry ───────────────────────────────────────");
            println!("  Frame          {}x{} px", raster.width(), raster.height());
            println!("  Blocks         {}x{}", g.block_height(), g.block_width());
            println!("  Pixel width    {:.3}", g.pixel_width);
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn load_registry(files: &[PathBuf]) -> Result<PaletteRegistry, Box<dyn std::error::Error>> {
    let mut registry = PaletteRegistry::with_builtins();
    for path in files {
        let palette: Palette = serde_json::from_slice(&std::fs::read(path)?)?;
        registry.insert_custom(palette)?;
    }
    Ok(registry)
}

fn resolve_palette(registry: &PaletteRegistry, s: &str) -> Result<PaletteId, Box<dyn std::error::Error>> {
    if let Some(id) = PaletteId::parse(s) {
        return Ok(id);
    }
    registry
        .find_by_nickname(s)
        .map(|p| p.id)
        .ok_or_else(|| format!("unknown palette '{s}'").into())
}

fn parse_grid(s: &str) -> Result<BlockGrid, Box<dyn std::error::Error>> {
    let (h, w) = s.split_once(['x', 'X']).ok_or("grid must look like 45x80")?;
    Ok(BlockGrid::new(h.trim().parse()?, w.trim().parse()?)?)
}

/// Keep only the final path component of a manifest name.
fn sanitize(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "payload.bin".into())
}
