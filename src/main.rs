//! CLI entry point: identifies and slices out channels into stacks through
//! time.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};
use log::info;

use trap_compiler::config::{self, DetectionStrategy};
use trap_compiler::model::{self, CustomObjects, SegmentationModel};
use trap_compiler::pipeline::CompilePipeline;

#[derive(Debug, Parser)]
#[command(
    name = "trap_compiler",
    about = "Identifies and slices out channels into individual stacks through time."
)]
struct Cli {
    /// YAML file containing run parameters.
    #[arg(short = 'f', long)]
    paramfile: PathBuf,

    /// Fields of view to analyze, e.g. "1" or "1,2,3".
    #[arg(short = 'o', long)]
    fov: Option<String>,

    /// Number of worker threads.
    #[arg(short = 'j', long)]
    nproc: Option<usize>,

    /// Path to the trained trap segmentation model.
    #[arg(short = 'm', long)]
    modelfile: Option<PathBuf>,
}

fn main() -> Result<()> {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    builder.init();

    let cli = Cli::parse();

    info!("loading experiment parameters from {}", cli.paramfile.display());
    let mut config = config::load_config(&cli.paramfile)?;

    if let Some(fov) = &cli.fov {
        config.fov_filter = fov
            .split(',')
            .map(|v| v.trim().parse())
            .collect::<std::result::Result<Vec<u32>, _>>()
            .with_context(|| format!("bad --fov list: {fov}"))?;
    }
    if let Some(nproc) = cli.nproc {
        config.num_workers = nproc;
    }
    if let Some(modelfile) = cli.modelfile {
        config.compile.segmentation.model_file = modelfile;
    }
    info!("using {} worker threads", effective_workers(config.num_workers));

    let model: Option<Box<dyn SegmentationModel>> =
        if config.compile.strategy == DetectionStrategy::Segmentation {
            let path = config.compile.segmentation.model_file.clone();
            info!("loading segmentation model from {}", path.display());
            Some(Box::new(model::load_model(
                &path,
                &CustomObjects::trap_losses(),
            )?))
        } else {
            None
        };

    let pipeline = CompilePipeline::new(config);
    let summary = pipeline.run(model.as_deref())?;

    info!(
        "done: {} frames ({} extraction failures), {} fovs, {} channel stacks, \
         {} pages, {} frames rejected, {} channels dropped",
        summary.frames_total,
        summary.extraction_failures,
        summary.fovs,
        summary.channels_written,
        summary.pages_written,
        summary.frames_rejected,
        summary.channels_dropped
    );
    Ok(())
}

fn effective_workers(configured: usize) -> usize {
    if configured == 0 {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    } else {
        configured
    }
}
