#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ploop::{
    ClusterShift, Delta, DeltaId, DeltaKind, DeltaOptions, EngineConfig, FileByteDevice,
    Generation, LayerSpec, PloopEngine, StackDescriptor,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "ploop", about = "ploop — stackable virtual block device images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh image-base file.
    Create {
        /// Path of the image file to create.
        image: PathBuf,
        /// Virtual disk size in clusters.
        #[arg(long)]
        size_clusters: u64,
        /// log2 of the cluster size in 512-byte sectors (11 = 1 MiB).
        #[arg(long, default_value_t = 11)]
        cluster_shift: u32,
    },
    /// Inspect a stack of image files, base first.
    Inspect {
        /// Layer files, base first, top last.
        #[arg(required = true)]
        layers: Vec<PathBuf>,
        /// Treat the first layer as a raw base (flat file, no header).
        #[arg(long)]
        raw_base: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Freeze the current top and stack a new delta file above it.
    Snapshot {
        /// Existing layer files, base first, top last.
        #[arg(required = true)]
        layers: Vec<PathBuf>,
        /// Treat the first layer as a raw base.
        #[arg(long)]
        raw_base: bool,
        /// Path of the new delta file to create.
        #[arg(long)]
        new_delta: PathBuf,
    },
    /// Merge a delta into the layer directly beneath it.
    Merge {
        /// Layer files, base first, top last.
        #[arg(required = true)]
        layers: Vec<PathBuf>,
        /// Treat the first layer as a raw base.
        #[arg(long)]
        raw_base: bool,
        /// Id of the surviving lower layer (position in the stack).
        #[arg(long)]
        lower: u32,
        /// Id of the upper layer to fold away.
        #[arg(long)]
        upper: u32,
    },
    /// Grow the virtual size of the stack's top delta.
    Grow {
        /// Layer files, base first, top last.
        #[arg(required = true)]
        layers: Vec<PathBuf>,
        /// Treat the first layer as a raw base.
        #[arg(long)]
        raw_base: bool,
        /// New virtual size in clusters.
        #[arg(long)]
        size_clusters: u64,
    },
    /// Read a byte range and hex-dump it (or write it to a file).
    Read {
        /// Layer files, base first, top last.
        #[arg(required = true)]
        layers: Vec<PathBuf>,
        /// Treat the first layer as a raw base.
        #[arg(long)]
        raw_base: bool,
        /// Start offset in 512-byte sectors.
        #[arg(long)]
        offset_sectors: u64,
        /// Length in bytes (must be a sector multiple).
        #[arg(long)]
        length: usize,
        /// Write the raw bytes here instead of hex-dumping.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write the contents of a file at a sector offset.
    Write {
        /// Layer files, base first, top last.
        #[arg(required = true)]
        layers: Vec<PathBuf>,
        /// Treat the first layer as a raw base.
        #[arg(long)]
        raw_base: bool,
        /// Start offset in 512-byte sectors.
        #[arg(long)]
        offset_sectors: u64,
        /// File with the payload (length must be a sector multiple).
        #[arg(long)]
        data: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct CreateOutput {
    image: String,
    size_clusters: u64,
    cluster_bytes: u64,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Create {
            image,
            size_clusters,
            cluster_shift,
        } => create(&image, size_clusters, cluster_shift),
        Command::Inspect {
            layers,
            raw_base,
            json,
        } => inspect(&layers, raw_base, json),
        Command::Snapshot {
            layers,
            raw_base,
            new_delta,
        } => snapshot(&layers, raw_base, &new_delta),
        Command::Merge {
            layers,
            raw_base,
            lower,
            upper,
        } => merge(&layers, raw_base, lower, upper),
        Command::Grow {
            layers,
            raw_base,
            size_clusters,
        } => grow(&layers, raw_base, size_clusters),
        Command::Read {
            layers,
            raw_base,
            offset_sectors,
            length,
            out,
        } => read(&layers, raw_base, offset_sectors, length, out.as_deref()),
        Command::Write {
            layers,
            raw_base,
            offset_sectors,
            data,
        } => write(&layers, raw_base, offset_sectors, &data),
    }
}

fn open_stack(layers: &[PathBuf], raw_base: bool) -> Result<PloopEngine> {
    let mut specs = Vec::with_capacity(layers.len());
    for (index, path) in layers.iter().enumerate() {
        let spec = if raw_base && index == 0 {
            LayerSpec::raw_path(path)
        } else {
            LayerSpec::image_path(path)
        };
        specs.push(spec);
    }
    PloopEngine::open(StackDescriptor { layers: specs }, EngineConfig::default())
        .with_context(|| format!("opening stack of {} layer(s)", layers.len()))
}

fn create(image: &Path, size_clusters: u64, cluster_shift: u32) -> Result<()> {
    let shift = ClusterShift::new(cluster_shift).context("invalid cluster shift")?;
    let device = Arc::new(
        FileByteDevice::create(image, 0)
            .with_context(|| format!("creating {}", image.display()))?,
    );
    Delta::format(
        DeltaId(0),
        device,
        DeltaKind::ImageBase,
        shift,
        size_clusters,
        Generation(0),
        DeltaOptions::default(),
    )
    .context("formatting image")?;

    let output = CreateOutput {
        image: image.display().to_string(),
        size_clusters,
        cluster_bytes: shift.bytes(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn inspect(layers: &[PathBuf], raw_base: bool, json: bool) -> Result<()> {
    let engine = open_stack(layers, raw_base)?;
    let info = engine.stack_info();
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!(
            "stack: {} layer(s), cluster size {} bytes, virtual {} clusters, generation {}",
            info.deltas.len(),
            info.cluster_bytes,
            info.virtual_clusters,
            info.generation
        );
        for delta in &info.deltas {
            println!(
                "  delta {}: {:?}{} {} virtual / {} allocated clusters, generation {}",
                delta.id,
                delta.kind,
                if delta.writable { " (writable)" } else { "" },
                delta.virtual_clusters,
                delta.allocated_clusters,
                delta
                    .generation
                    .map_or_else(|| "-".to_owned(), |generation| generation.to_string()),
            );
        }
    }
    engine.close().context("closing stack")?;
    Ok(())
}

fn snapshot(layers: &[PathBuf], raw_base: bool, new_delta: &Path) -> Result<()> {
    let engine = open_stack(layers, raw_base)?;
    let device = Arc::new(
        FileByteDevice::create(new_delta, 0)
            .with_context(|| format!("creating {}", new_delta.display()))?,
    );
    let id = engine.snapshot(device).context("taking snapshot")?;
    engine.close().context("closing stack")?;
    println!("snapshot created: delta {id:?} at {}", new_delta.display());
    Ok(())
}

fn merge(layers: &[PathBuf], raw_base: bool, lower: u32, upper: u32) -> Result<()> {
    let engine = open_stack(layers, raw_base)?;
    engine
        .merge(DeltaId(lower), DeltaId(upper))
        .context("merging deltas")?;
    engine.close().context("closing stack")?;
    println!("merged delta {upper} into {lower}");
    Ok(())
}

fn grow(layers: &[PathBuf], raw_base: bool, size_clusters: u64) -> Result<()> {
    let engine = open_stack(layers, raw_base)?;
    engine.grow(size_clusters).context("growing virtual size")?;
    engine.close().context("closing stack")?;
    println!("virtual size is now {size_clusters} clusters");
    Ok(())
}

fn read(
    layers: &[PathBuf],
    raw_base: bool,
    offset_sectors: u64,
    length: usize,
    out: Option<&Path>,
) -> Result<()> {
    let engine = open_stack(layers, raw_base)?;
    let mut buf = vec![0_u8; length];
    engine
        .read_at(offset_sectors, &mut buf)
        .context("reading range")?;
    engine.close().context("closing stack")?;

    match out {
        Some(path) => {
            std::fs::write(path, &buf)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        None => hex_dump(&buf, offset_sectors * 512),
    }
    Ok(())
}

fn write(layers: &[PathBuf], raw_base: bool, offset_sectors: u64, data: &Path) -> Result<()> {
    let payload =
        std::fs::read(data).with_context(|| format!("reading {}", data.display()))?;
    if payload.is_empty() {
        bail!("payload file is empty");
    }
    let engine = open_stack(layers, raw_base)?;
    engine
        .write_at(offset_sectors, &payload)
        .context("writing range")?;
    engine.flush().context("flushing")?;
    engine.close().context("closing stack")?;
    println!("wrote {} bytes at sector {offset_sectors}", payload.len());
    Ok(())
}

fn hex_dump(bytes: &[u8], base_offset: u64) {
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let offset = base_offset + (row as u64) * 16;
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&byte| {
                if byte.is_ascii_graphic() || byte == b' ' {
                    byte as char
                } else {
                    '.'
                }
            })
            .collect();
        println!("{offset:08x}  {:<47}  |{ascii}|", hex.join(" "));
    }
}
