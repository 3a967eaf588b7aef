#![forbid(unsafe_code)]

mod parse;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use vdo_error::VdoError;
use vdo_format::{FormatConfig, Volume, force_rebuild, format, set_read_only_mode};
use vdo_geometry::IndexConfig;
use vdo_layer::FileLayer;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "vdoprep",
    about = "Prepare a block device as a VDO volume and adjust it out-of-band"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format a device with a fresh VDO volume (destructive).
    Format {
        /// Path to the backing device or image file.
        device: PathBuf,
        /// Logical capacity, e.g. "10G"; 0 derives the maximum.
        #[arg(long, default_value = "0")]
        logical_size: String,
        /// Slab size, a power of two, e.g. "2G".
        #[arg(long, default_value = "2G")]
        slab_size: String,
        /// Blocks of journal at the tail of each slab.
        #[arg(long, default_value_t = 224)]
        slab_journal_blocks: u64,
        /// Recovery journal size, a power of two, e.g. "32M".
        #[arg(long, default_value = "32M")]
        journal_size: String,
        /// Dedup index memory: 0.25, 0.5, 0.75, or gigabytes. Omit to
        /// format without an index region.
        #[arg(long)]
        uds_memory: Option<String>,
        /// Use a sparse dedup index.
        #[arg(long)]
        uds_sparse: bool,
        /// Dedup index checkpoint frequency.
        #[arg(long, default_value_t = 0)]
        uds_checkpoint_frequency: u32,
    },
    /// Mark a read-only VDO for a full rebuild at next start.
    ForceRebuild {
        /// Path to the backing device or image file.
        device: PathBuf,
    },
    /// Put a VDO into read-only mode.
    ReadOnly {
        /// Path to the backing device or image file.
        device: PathBuf,
    },
    /// Show the geometry and super block of a formatted device.
    Inspect {
        /// Path to the backing device or image file.
        device: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    uuid: String,
    nonce: u64,
    release_version: u32,
    state: String,
    logical_blocks: u64,
    physical_blocks: u64,
    slab_size: u64,
    slab_count: u64,
    data_region_start: u64,
    index_blocks: u64,
    complete_recoveries: u64,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("vdoprep: {error:#}");
        let code = error
            .downcast_ref::<VdoError>()
            .map_or(1, VdoError::to_exit_code);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Format {
            device,
            logical_size,
            slab_size,
            slab_journal_blocks,
            journal_size,
            uds_memory,
            uds_sparse,
            uds_checkpoint_frequency,
        } => format_cmd(
            &device,
            &logical_size,
            &slab_size,
            slab_journal_blocks,
            &journal_size,
            uds_memory.as_deref(),
            uds_sparse,
            uds_checkpoint_frequency,
        ),
        Command::ForceRebuild { device } => {
            let layer = open_layer(&device)?;
            force_rebuild(&layer)?;
            println!("marked for rebuild: {}", device.display());
            Ok(())
        }
        Command::ReadOnly { device } => {
            let layer = open_layer(&device)?;
            set_read_only_mode(&layer)?;
            println!("set read-only: {}", device.display());
            Ok(())
        }
        Command::Inspect { device, json } => inspect(&device, json),
    }
}

fn open_layer(device: &PathBuf) -> Result<FileLayer> {
    FileLayer::open(device).with_context(|| format!("failed to open {}", device.display()))
}

#[allow(clippy::too_many_arguments)]
fn format_cmd(
    device: &PathBuf,
    logical_size: &str,
    slab_size: &str,
    slab_journal_blocks: u64,
    journal_size: &str,
    uds_memory: Option<&str>,
    uds_sparse: bool,
    uds_checkpoint_frequency: u32,
) -> Result<()> {
    let index_config = uds_memory
        .map(|memory| -> Result<IndexConfig> {
            Ok(IndexConfig {
                memory: parse::parse_mem(memory)?,
                checkpoint_frequency: uds_checkpoint_frequency,
                sparse: uds_sparse,
            })
        })
        .transpose()?;

    let config = FormatConfig {
        physical_blocks: 0,
        logical_blocks: parse::parse_size_blocks(logical_size, false)?,
        slab_size: parse::parse_size_blocks(slab_size, false)?,
        slab_journal_blocks,
        recovery_journal_size: parse::parse_size_blocks(journal_size, false)?,
        index_config,
    };

    let layer = open_layer(device)?;
    format(&config, &layer)?;

    let volume = Volume::load(&layer).context("formatted volume failed to load back")?;
    println!(
        "formatted {}: logical {} blocks, {} slabs of {}",
        device.display(),
        volume.super_block.component.config.logical_blocks,
        volume.super_block.depot.slab_count,
        volume.super_block.depot.slab_config.slab_blocks,
    );
    Ok(())
}

fn inspect(device: &PathBuf, json: bool) -> Result<()> {
    let layer = open_layer(device)?;
    let volume = Volume::load(&layer)?;

    let config = &volume.super_block.component.config;
    let output = InspectOutput {
        uuid: volume.geometry.uuid.to_string(),
        nonce: volume.geometry.nonce,
        release_version: volume.geometry.release_version,
        state: format!("{:?}", volume.state()),
        logical_blocks: config.logical_blocks,
        physical_blocks: config.physical_blocks,
        slab_size: config.slab_size,
        slab_count: volume.super_block.depot.slab_count,
        data_region_start: volume.geometry.data_region.start.0,
        index_blocks: volume.geometry.index_region.length,
        complete_recoveries: volume.super_block.component.complete_recoveries,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("VDO volume {}", output.uuid);
        println!("state: {}", output.state);
        println!("release_version: {}", output.release_version);
        println!("logical_blocks: {}", output.logical_blocks);
        println!("physical_blocks: {}", output.physical_blocks);
        println!("slab_size: {}", output.slab_size);
        println!("slab_count: {}", output.slab_count);
        println!("data_region_start: {}", output.data_region_start);
        println!("index_blocks: {}", output.index_blocks);
        println!("complete_recoveries: {}", output.complete_recoveries);
    }
    Ok(())
}
