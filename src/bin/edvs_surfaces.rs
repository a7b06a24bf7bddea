use std::io::{self, BufRead, BufWriter, Read, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

use edvs_surfaces::cache::EventCache;
use edvs_surfaces::config::{Config, SurfaceKind};
use edvs_surfaces::corner::CornerFilter;
use edvs_surfaces::edge::{EdgeCache, FuzzyEdgeCache};
use edvs_surfaces::scalar::ScalarSurface;
use edvs_surfaces::{Event, EventRef, SurfaceError};

#[derive(Parser)]
#[command(name = "edvs-surfaces")]
#[command(about = "Build event surfaces from an eDVS event stream on stdin", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Sensor width (overrides the configuration)
    #[arg(long, global = true)]
    width: Option<usize>,

    /// Sensor height (overrides the configuration)
    #[arg(long, global = true)]
    height: Option<usize>,

    /// Input encoding
    #[arg(short, long, global = true, value_enum, default_value_t = InputFormat::Tsv)]
    format: InputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum InputFormat {
    /// Tab-separated `x y timestamp polarity` lines
    Tsv,
    /// Little-endian (timestamp word, address word) pairs
    Binary,
}

#[derive(Subcommand)]
enum Commands {
    /// Accumulate a scalar surface and print its non-zero cells
    Surface {
        /// Update rule (eros, tos, sits, pim, sae, bin)
        #[arg(short, long)]
        kind: Option<SurfaceKind>,

        /// Update window side
        #[arg(short = 'k', long)]
        kernel_size: Option<usize>,
    },

    /// Keep the most recent event per pixel and print the final cache
    Cache,

    /// Run the edge cache and print the surviving edge events
    Edge {
        /// Use the probabilistic edge map instead
        #[arg(long)]
        fuzzy: bool,
    },

    /// Print events classified as corners
    Corners {
        /// Events per detection batch
        #[arg(short, long, default_value_t = 1000)]
        batch: usize,
    },
}

#[derive(Default)]
struct Counts {
    read: u64,
    malformed: u64,
}

fn parse_line(line: &str) -> Option<Event> {
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < 4 {
        return None;
    }
    let x: u16 = parts[0].trim().parse().ok()?;
    let y: u16 = parts[1].trim().parse().ok()?;
    let ts: u32 = parts[2].trim().parse().ok()?;
    let pol: u8 = parts[3].trim().parse().ok()?;
    Some(Event::new(x, y, ts, pol != 0))
}

/// Decode every event on stdin and hand it to `f`.
fn for_each_event(
    format: InputFormat,
    counts: &mut Counts,
    mut f: impl FnMut(Event) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let stdin = io::stdin();
    match format {
        InputFormat::Tsv => {
            for line in stdin.lock().lines() {
                let line = line.context("reading stdin")?;
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match parse_line(line) {
                    Some(event) => {
                        counts.read += 1;
                        f(event)?;
                    }
                    None => counts.malformed += 1,
                }
            }
        }
        InputFormat::Binary => {
            let mut bytes = Vec::new();
            stdin.lock().read_to_end(&mut bytes).context("reading stdin")?;
            for pair in bytes.chunks_exact(8) {
                let ts = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
                let addr = u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
                match Event::decode(ts, addr) {
                    Some(event) => {
                        counts.read += 1;
                        f(event)?;
                    }
                    None => counts.malformed += 1,
                }
            }
        }
    }
    Ok(())
}

/// Out-of-bounds events are counted and skipped; anything else is fatal.
fn tolerate_bounds(result: Result<(), SurfaceError>, counts: &mut u64) -> anyhow::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(SurfaceError::OutOfBounds { .. }) => {
            *counts += 1;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(w) = cli.width {
        config.width = w;
    }
    if let Some(h) = cli.height {
        config.height = h;
    }
    if let Commands::Surface { kind, kernel_size } = &cli.command {
        if let Some(kind) = kind {
            config.surface.kind = *kind;
            config.surface.parameter = kind.default_parameter();
        }
        if let Some(k) = kernel_size {
            config.surface.kernel_size = *k;
        }
    }
    config.validate()?;
    debug!(width = config.width, height = config.height, "configuration loaded");

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut counts = Counts::default();
    let mut rejected = 0u64;

    match cli.command {
        Commands::Surface { .. } => {
            let mut surface = ScalarSurface::from_config(config.width, config.height, &config.surface)?;
            for_each_event(cli.format, &mut counts, |e| {
                tolerate_bounds(surface.update_event(&e), &mut rejected)
            })?;
            for (i, v) in surface.surface().iter().enumerate() {
                if *v != 0.0 {
                    writeln!(out, "{}\t{}\t{}", i % config.width, i / config.width, v)?;
                }
            }
        }
        Commands::Cache => {
            let cache = EventCache::new(config.width, config.height)?;
            for_each_event(cli.format, &mut counts, |e| {
                tolerate_bounds(cache.add_event(e.into_ref()).map(|_| ()), &mut rejected)
            })?;
            let w = config.width as i64;
            let h = config.height as i64;
            for e in cache.get_surf(0, w - 1, 0, h - 1) {
                writeln!(out, "{}", e)?;
            }
        }
        Commands::Edge { fuzzy: false } => {
            let edge = EdgeCache::with_config(config.width, config.height, config.edge.clone())?;
            for_each_event(cli.format, &mut counts, |e| {
                tolerate_bounds(edge.add_event_to_edge(e.into_ref()).map(|_| ()), &mut rejected)
            })?;
            let w = config.width as i64;
            let h = config.height as i64;
            for e in edge.get_surf(0, w - 1, 0, h - 1) {
                writeln!(out, "{}", e)?;
            }
        }
        Commands::Edge { fuzzy: true } => {
            let edge = FuzzyEdgeCache::with_config(config.width, config.height, config.edge.clone())?;
            for_each_event(cli.format, &mut counts, |e| {
                tolerate_bounds(edge.add_event_to_edge(e.into_ref()).map(|_| ()), &mut rejected)
            })?;
            let w = config.width as i64;
            let h = config.height as i64;
            for e in edge.get_surf(0, w - 1, 0, h - 1) {
                writeln!(out, "{}\t{}", e.x, e.y)?;
            }
        }
        Commands::Corners { batch } => {
            let mut filter = CornerFilter::from_config(&config)?;
            filter.start()?;
            let batch = batch.max(1);
            let mut pending = Vec::with_capacity(batch);
            let (width, height) = (config.width, config.height);

            let mut run = |pending: &mut Vec<EventRef>, out: &mut BufWriter<io::StdoutLock<'_>>| -> anyhow::Result<()> {
                for e in filter.detect(pending)? {
                    writeln!(out, "{}", e)?;
                }
                pending.clear();
                Ok(())
            };
            for_each_event(cli.format, &mut counts, |e| {
                if e.x as usize >= width || e.y as usize >= height {
                    rejected += 1;
                    return Ok(());
                }
                pending.push(e.into_ref());
                if pending.len() >= batch {
                    run(&mut pending, &mut out)?;
                }
                Ok(())
            })?;
            run(&mut pending, &mut out)?;
        }
    }
    out.flush()?;

    info!(
        read = counts.read,
        malformed = counts.malformed,
        rejected,
        "stream finished"
    );
    eprintln!(
        "edvs-surfaces: {} events read, {} malformed, {} out of bounds",
        counts.read, counts.malformed, rejected
    );
    Ok(())
}
