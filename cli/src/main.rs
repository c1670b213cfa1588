use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tapewave_core::{
    AnalysisWriter, CassetteImage, LoadContext, LogProgress, RegionType, TurboDecodeAlgorithm, DATA_SAMPLE_RATE,
};
use thiserror::Error;

/// Regions listed individually by `info` before it switches to totals only.
const MAX_LISTED_REGIONS: usize = 32;

#[derive(Parser)]
#[command(name = "tapewave")]
#[command(about = "Inspect and convert Atari cassette tape images (CAS and WAV)")]
struct Cli {
    /// Edge detector for direct (turbo) decoding of audio input
    #[arg(long, global = true, default_value_t = TurboDecodeAlgorithm::PeakFilter)]
    turbo_algorithm: TurboDecodeAlgorithm,

    /// Log the start time of every CAS data block
    #[arg(long, global = true)]
    trace_blocks: bool,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show track lengths, regions and checksums of a tape image
    Info {
        /// CAS or WAV image
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Convert a tape image to CAS or to a 44.1 kHz FSK recording
    Convert {
        /// CAS or WAV image
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output file
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// Output format (default: from the output extension)
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Decode an audio tape while writing the 6-channel decoder trace
    Analyze {
        /// Audio recording of a tape
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Analysis trace output
        #[arg(value_name = "TRACE.WAV")]
        trace: PathBuf,

        /// Edge detector (overrides --turbo-algorithm)
        #[arg(short, long)]
        algorithm: Option<TurboDecodeAlgorithm>,

        /// Turbo pre-filter cutoff in Hz; negative for a fixed coefficient
        #[arg(long, allow_hyphen_values = true)]
        hpf_cutoff: Option<f32>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Cas,
    Wav,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("cannot tell the output format of {}; pass --format cas or --format wav", .0.display())]
    UnknownOutputFormat(PathBuf),
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = LoadContext::new()
        .with_turbo_algorithm(cli.turbo_algorithm)
        .with_trace_blocks(cli.trace_blocks);

    match cli.command {
        Commands::Info { input } => info_command(&input, &ctx)?,
        Commands::Convert { input, output, format } => convert_command(&input, &output, format, &ctx)?,
        Commands::Analyze {
            input,
            trace,
            algorithm,
            hpf_cutoff,
        } => {
            let mut ctx = ctx;
            if let Some(algorithm) = algorithm {
                ctx = ctx.with_turbo_algorithm(algorithm);
            }
            if let Some(cutoff) = hpf_cutoff {
                ctx = ctx.with_hpf_cutoff(cutoff);
            }
            analyze_command(&input, &trace, &ctx)?
        }
    }

    Ok(())
}

fn load_image(path: &Path, ctx: &LoadContext) -> Result<CassetteImage, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let mut image = CassetteImage::new();
    image.load(file, ctx, None, &mut LogProgress::default())?;
    Ok(image)
}

fn seconds(samples: u32) -> f64 {
    samples as f64 / DATA_SAMPLE_RATE
}

fn region_name(region_type: RegionType) -> &'static str {
    match region_type {
        RegionType::Mark => "mark",
        RegionType::Raw => "raw",
        RegionType::DecodedData => "data",
    }
}

fn info_command(input_path: &Path, ctx: &LoadContext) -> Result<(), Box<dyn std::error::Error>> {
    let image = load_image(input_path, ctx)?;

    println!("Loaded {}", input_path.display());
    println!(
        "Data track: {} samples ({:.2} s)",
        image.data_len(),
        seconds(image.data_len())
    );
    println!(
        "Audio track: {} samples, separate audio channel: {}",
        image.audio_len(),
        if image.is_audio_present() { "yes" } else { "no" }
    );

    let mut totals: BTreeMap<&'static str, (usize, u64)> = BTreeMap::new();
    let mut listed = 0;
    let mut pos = 0;

    println!("Regions:");
    while pos < image.data_len() {
        let region = image.region_info(pos);
        let name = region_name(region.region_type);

        if listed < MAX_LISTED_REGIONS {
            println!(
                "  {:>10.3} s  {:<5} {} samples",
                seconds(region.region_start),
                name,
                region.region_len
            );
        }
        listed += 1;

        let entry = totals.entry(name).or_default();
        entry.0 += 1;
        entry.1 += region.region_len as u64;
        pos = region.region_start + region.region_len;
    }

    if listed > MAX_LISTED_REGIONS {
        println!("  ... {} more", listed - MAX_LISTED_REGIONS);
    }

    for (name, (count, samples)) in &totals {
        println!("Total {name}: {count} region(s), {samples} samples");
    }

    if image.has_cas_incompatible_std_blocks() {
        println!("Note: trimmed data blocks will be stored as pulses in CAS");
    }

    match image.checksums() {
        Some(sums) => {
            println!("CRC-32: {:08X}", sums.crc32);
            println!("SHA-256: {}", sums.sha256_hex());
        }
        None => println!("Checksums: not available for this format"),
    }

    Ok(())
}

fn infer_format(path: &Path) -> Option<OutputFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "cas" => Some(OutputFormat::Cas),
        "wav" => Some(OutputFormat::Wav),
        _ => None,
    }
}

fn convert_command(
    input_path: &Path,
    output_path: &Path,
    format: Option<OutputFormat>,
    ctx: &LoadContext,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = format
        .or_else(|| infer_format(output_path))
        .ok_or_else(|| CliError::UnknownOutputFormat(output_path.to_path_buf()))?;

    let image = load_image(input_path, ctx)?;
    println!(
        "Read {} ({:.2} s of tape)",
        input_path.display(),
        seconds(image.data_len())
    );

    let file = File::create(output_path)?;
    match format {
        OutputFormat::Cas => {
            if image.has_cas_incompatible_std_blocks() {
                log::warn!("Trimmed data blocks are written as raw pulses");
            }
            image.save_cas(file)?;
        }
        OutputFormat::Wav => image.save_wav(BufWriter::new(file))?,
    }

    println!("Wrote {:?} image to {}", format, output_path.display());
    Ok(())
}

fn analyze_command(input_path: &Path, trace_path: &Path, ctx: &LoadContext) -> Result<(), Box<dyn std::error::Error>> {
    let input = BufReader::new(File::open(input_path)?);
    let mut writer = AnalysisWriter::new(BufWriter::new(File::create(trace_path)?))?;

    let mut image = CassetteImage::new();
    image.load(input, ctx, Some(&mut writer), &mut LogProgress::default())?;
    writer.finalize()?;

    println!(
        "Decoded {} samples ({:.2} s) with {}",
        image.data_len(),
        seconds(image.data_len()),
        ctx.turbo_algorithm
    );
    println!("Wrote analysis trace to {}", trace_path.display());
    Ok(())
}
