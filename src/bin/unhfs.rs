//! Command-line extractor for HFS+ and HFSX disk images.

use std::{fs::File, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;

use hfsunpack::{
    detect::DetectionPipeline,
    extract::{extract, ExtractOptions},
    hfsplus::HfsVolume,
    source::SharedByteSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
enum ResourceForkMode {
    /// Resource forks are not extracted.
    None,
    /// Resource forks become AppleDouble `._name` sidecar files.
    AppleDouble,
}

/// Extract the contents of an HFS+ or HFSX disk image.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Disk image to read (raw, or Apple-partitioned)
    image: PathBuf,

    /// Directory to extract into
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Path inside the volume to extract
    #[arg(long, default_value = "/")]
    fsroot: String,

    /// Create a directory for a folder root instead of extracting its
    /// contents directly into the output directory
    #[arg(long)]
    create: bool,

    /// How to represent resource forks
    #[arg(long, value_enum, default_value_t = ResourceForkMode::None)]
    resforks: ResourceForkMode,

    /// Extract this partition instead of the first Apple partition
    #[arg(long)]
    partition: Option<usize>,

    /// Print every extracted entry
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> Result<()> {
    let stream =
        File::open(&args.image).with_context(|| format!("opening {:?}", args.image))?;
    let shared = SharedByteSource::open(stream).context("reading image length")?;

    let resolved = DetectionPipeline::default()
        .resolve(shared.clone().into_source(), args.partition)
        .context("identifying image contents")?;
    match &resolved.partition {
        Some(partition) => info!(
            "found {} filesystem in partition {} ({:?})",
            resolved.kind, partition.index, partition.name
        ),
        None => info!("found {} filesystem", resolved.kind),
    }

    let volume = HfsVolume::open(resolved.source, resolved.kind)
        .context("mounting filesystem")?;
    let options = ExtractOptions {
        flatten_root: !args.create,
        resource_forks: args.resforks == ResourceForkMode::AppleDouble,
        verbose: args.verbose,
    };
    let summary = extract(&volume, &args.fsroot, &args.output, &options)?;

    // terminal operation on the image; everything readable is dropped
    shared.close().context("releasing the image")?;

    for failure in &summary.failures {
        eprintln!("failed: {}: {}", failure.path.display(), failure.reason);
    }
    println!("{summary}");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = if args.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("unhfs: {err:#}");
            ExitCode::FAILURE
        }
    }
}
