//! Multi-detector caked integration of diffraction images.
//!
//! Each FILE pattern selects the frames of one detector; the sorted matches
//! are zipped into image sets and integrated with the settings of the JSON
//! configuration. Run with `--template` to write a starting configuration.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cakemap::config::TEMPLATE_FILE;
use cakemap::{
    BatchOptions, BatchOrchestrator, CoordinateCache, Detector, GeometricResampler,
    HistogramIntegrator, IntegrationConfig, Pipeline, SpectrumFormat,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Command line multi-geometry integration tool for detector images"
)]
struct Args {
    #[arg(
        value_name = "FILE",
        required_unless_present = "template",
        help = "File pattern per detector, may contain wildcards; matches are sorted"
    )]
    files: Vec<String>,

    #[arg(
        short = 'j',
        long,
        required_unless_present = "template",
        help = "JSON file with the integration settings"
    )]
    json: Option<PathBuf>,

    #[arg(
        short = 'o',
        long,
        help = "Output directory (default: directory of the first FILE pattern)"
    )]
    output: Option<PathBuf>,

    #[arg(short = 'w', long, help = "Rewrite image sets that already have output")]
    overwrite: bool,

    #[arg(
        short = 'p',
        long,
        help = "Number of worker threads; 1 runs serially (default: all cpus)"
    )]
    poolsize: Option<usize>,

    #[arg(
        short = 'f',
        long = "format",
        num_args = 1..,
        default_value = "dat",
        help = "Output formats: dat, xy, xye, xy-noheader, fxye, esg, esg1, esg_detector"
    )]
    formats: Vec<SpectrumFormat>,

    #[arg(
        long,
        default_value = ".",
        help = "Directory holding the binned detector coordinate cache"
    )]
    cache_dir: PathBuf,

    #[arg(short = 'q', long, help = "Only log warnings and hide the progress bar")]
    quiet: bool,

    #[arg(short = 't', long, help = "Write a template JSON configuration and exit")]
    template: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if args.template {
        IntegrationConfig::write_template(TEMPLATE_FILE)
            .with_context(|| format!("writing {TEMPLATE_FILE}"))?;
        info!("Exported JSON template to {}", TEMPLATE_FILE);
        return Ok(());
    }

    let Some(json) = args.json.as_ref() else {
        bail!("--json is required");
    };
    let config = IntegrationConfig::load(json)
        .with_context(|| format!("loading configuration {}", json.display()))?;
    let detectors =
        Detector::from_config_all(&config).context("initialising detectors from calibration")?;

    let mut formats = Vec::new();
    for format in args.formats {
        if !formats.contains(&format) {
            formats.push(format);
        }
    }

    let resampler = GeometricResampler::new(CoordinateCache::new(&args.cache_dir));
    let pipeline = Pipeline::new(
        &config,
        detectors,
        Box::new(HistogramIntegrator),
        resampler,
        formats,
    )?;

    let orchestrator = BatchOrchestrator::new(
        pipeline,
        BatchOptions {
            output_dir: args.output,
            overwrite: args.overwrite,
            pool_size: args.poolsize,
            quiet: args.quiet,
        },
    );
    let summary = orchestrator.run(&args.files)?;

    let failed = summary.failures().count();
    if failed > 0 {
        bail!("{failed} of {} image sets failed", summary.outcomes.len());
    }
    Ok(())
}
