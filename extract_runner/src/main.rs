// Command-line runner for the `depth_extract` library: extracts one or more
// recordings in parallel against a shared background and ROI.

use anyhow::{Context, bail};
use clap::Parser;
use depth_extract::core_modules::containers::{load_background, load_roi};
use depth_extract::{ExtractConfig, ExtractionJob, ExtractionPool};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "extract_runner", about = "Extract aligned crops, masks and scalars from depth recordings")]
struct Cli {
    /// Raw depth recordings, or tar archives holding them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Background depth image (16-bit or float TIFF/PNG).
    #[arg(long)]
    background: PathBuf,

    /// ROI mask image; non-zero pixels are inside.
    #[arg(long)]
    roi: PathBuf,

    /// TOML config file; omitted keys take their defaults.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "proc")]
    output_dir: PathBuf,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long)]
    fps: Option<f64>,

    /// Extract at most this many frames per recording.
    #[arg(long)]
    num_frames: Option<usize>,

    /// Recordings extracted at once (default: one per CPU).
    #[arg(long)]
    workers: Option<usize>,

    /// Skip the preview video.
    #[arg(long)]
    no_preview: bool,
}

fn load_config(cli: &Cli) -> anyhow::Result<ExtractConfig> {
    let mut config = match &cli.config {
        Some(path) => ExtractConfig::load(path)?,
        None => ExtractConfig::default(),
    };
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(fps) = cli.fps {
        config.fps = fps;
    }
    if cli.num_frames.is_some() {
        config.num_frames = cli.num_frames;
    }
    config.validate().context("invalid extraction config")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let background = Arc::new(load_background(&cli.background)?);
    let roi = Arc::new(load_roi(&cli.roi)?);

    let jobs: Vec<ExtractionJob> = cli
        .inputs
        .iter()
        .map(|input| {
            let name = input
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .with_context(|| format!("cannot name output for {}", input.display()))?;
            Ok(ExtractionJob {
                name,
                input: input.clone(),
                output_dir: cli.output_dir.clone(),
                background: Arc::clone(&background),
                roi: Arc::clone(&roi),
                flips: None,
                preview: !cli.no_preview,
            })
        })
        .collect::<anyhow::Result<_>>()?;

    let pool = ExtractionPool::new(config, cli.workers)?;
    info!(recordings = jobs.len(), workers = pool.worker_count(), "starting extraction");
    let results = pool.extract_all(jobs).await;
    pool.shutdown().await;

    let mut failed = 0;
    for (input, result) in cli.inputs.iter().zip(results) {
        match result {
            Ok(summary) => info!(
                recording = %summary.name,
                frames = summary.frames_written,
                manifest = %summary.manifest.display(),
                "done"
            ),
            Err(e) => {
                failed += 1;
                error!(input = %input.display(), error = %e, "extraction failed");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} recordings failed", cli.inputs.len());
    }
    Ok(())
}
