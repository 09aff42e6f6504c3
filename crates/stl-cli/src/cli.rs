//! `stlctl` command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use stl_engine::{
    FileZoneDevice, FormatConfig, GroupStatus, Superblock, Volume, VolumeConfig, VolumeStats,
    ZoneDevice,
};
use tracing::info;

/// Top-level arguments.
#[derive(Parser)]
#[command(name = "stlctl")]
#[command(about = "Shingle translation layer volume tool", long_about = None)]
pub struct Cli {
    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands. Every command except `mkimage` takes an image created by
/// `mkimage`.
#[derive(Subcommand)]
pub enum Command {
    /// Create an empty zoned image file.
    Mkimage {
        /// Image path; must not exist yet.
        image: PathBuf,
        /// Number of bands.
        #[arg(short, long, default_value = "64")]
        bands: u32,
        /// Sectors per band.
        #[arg(short = 's', long, default_value = "65536")]
        band_size: u32,
    },
    /// Lay out a volume on an image.
    Format {
        /// Image path.
        image: PathBuf,
        /// Bands per group.
        #[arg(short, long, default_value = "32")]
        group_bands: u32,
        /// Metadata bands.
        #[arg(short, long, default_value = "4")]
        map_bands: u32,
        /// Physical to logical ratio per group.
        #[arg(short, long, default_value = "1.25")]
        over_provisioning: f64,
    },
    /// Print geometry, group allocation and counters.
    Info {
        /// Image path.
        image: PathBuf,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// List every extent and every data band.
    Dump {
        /// Image path.
        image: PathBuf,
    },
    /// Recover the volume and verify its invariants.
    Check {
        /// Image path.
        image: PathBuf,
    },
}

#[derive(Serialize)]
struct Report {
    superblock: Superblock,
    groups: Vec<GroupStatus>,
    extents: usize,
    stats: VolumeStats,
}

impl Cli {
    /// Executes the parsed subcommand.
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Mkimage {
                image,
                bands,
                band_size,
            } => mkimage(&image, bands, band_size),
            Command::Format {
                image,
                group_bands,
                map_bands,
                over_provisioning,
            } => format(
                &image,
                &FormatConfig {
                    group_bands,
                    map_bands,
                    over_provisioning,
                },
            ),
            Command::Info { image, json } => info(&image, json),
            Command::Dump { image } => dump(&image),
            Command::Check { image } => check(&image),
        }
    }
}

fn open(image: &Path) -> Result<Volume<FileZoneDevice>> {
    let device = FileZoneDevice::open(image)
        .with_context(|| format!("opening image {}", image.display()))?;
    let volume = Volume::open(device, VolumeConfig::foreground_only())
        .with_context(|| format!("recovering volume on {}", image.display()))?;
    Ok(volume)
}

fn mkimage(image: &Path, bands: u32, band_size: u32) -> Result<()> {
    if image.exists() {
        bail!("{} already exists", image.display());
    }
    let device = FileZoneDevice::create(image, bands, band_size)?;
    info!(path = %image.display(), bands, band_size, "image created");
    println!(
        "Created {}: {} bands of {} sectors",
        image.display(),
        device.band_count(),
        device.band_size()
    );
    Ok(())
}

fn format(image: &Path, config: &FormatConfig) -> Result<()> {
    let device = FileZoneDevice::open(image)
        .with_context(|| format!("opening image {}", image.display()))?;
    let sb = Volume::format(&device, config)?;
    println!(
        "Formatted {}: {} groups, {} logical sectors",
        image.display(),
        sb.n_groups,
        sb.size_sectors()
    );
    Ok(())
}

fn report(volume: &Volume<FileZoneDevice>) -> Result<Report> {
    let superblock = volume.superblock().clone();
    let groups = (0..superblock.n_groups)
        .map(|g| volume.group_status(g))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Report {
        superblock,
        groups,
        extents: volume.extent_count(),
        stats: volume.stats(),
    })
}

fn info(image: &Path, json: bool) -> Result<()> {
    let volume = open(image)?;
    let report = report(&volume)?;
    drop(volume);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    let sb = &report.superblock;
    println!("Bands: {} x {} sectors", sb.n_bands, sb.band_size);
    println!("Map bands: {}", sb.map_bands);
    println!(
        "Groups: {} x {} bands, {} logical sectors each",
        sb.n_groups, sb.group_size, sb.group_span
    );
    println!("Logical sectors: {}", sb.size_sectors());
    println!("Extents: {}", report.extents);
    println!("Recovered records: {}", report.stats.recovered_records);
    for g in &report.groups {
        println!(
            "  group {:>3}: {:>3} free, {:>3} full, frontier {} at {}",
            g.group, g.free, g.full, g.frontier, g.frontier_write_pointer
        );
    }
    Ok(())
}

fn dump(image: &Path) -> Result<()> {
    let volume = open(image)?;
    println!("{:>12} {:>8}  pba", "lba", "len");
    for extent in volume.extents() {
        let target = if extent.is_hole() {
            "trimmed".to_string()
        } else {
            extent.pba.to_string()
        };
        println!("{:>12} {:>8}  {}", extent.lba, extent.len, target);
    }
    let sb = volume.superblock();
    for band in 1 + sb.map_bands..sb.n_bands {
        if let Some(kind) = volume.band_type(band) {
            println!("band {:>5}: {:?}", band, kind);
        }
    }
    Ok(())
}

fn check(image: &Path) -> Result<()> {
    let volume = open(image)?;
    volume.check().context("volume invariants violated")?;
    let extents = volume.extent_count();
    drop(volume);
    println!("{}: ok, {} extents", image.display(), extents);
    Ok(())
}
