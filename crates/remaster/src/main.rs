mod cli;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use remaster_core::pipeline::{self, PipelineReport};
use remaster_core::video::decoder;
use remaster_core::PipelineConfig;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();

    match cli.command {
        cli::Command::Enhance {
            input,
            output,
            tuning,
            scale,
            fps,
            mode,
            denoise,
            aspect,
            side_fill,
            filter,
            crf,
            debug_frames,
            debug_every,
        } => {
            let mut config = load_config(tuning.config.as_deref())?;
            tuning.apply(&mut config);
            if let Some(scale) = scale {
                config.scale = scale;
            }
            if fps.is_some() {
                config.target_fps = fps;
            }
            if let Some(mode) = mode {
                config.mode = mode;
            }
            if let Some(radius) = denoise {
                config.denoise_radius = radius;
            }
            if aspect.is_some() {
                config.aspect = aspect;
            }
            if let Some(fill) = side_fill {
                config.side_fill = fill;
            }
            if let Some(filter) = filter {
                config.filter = filter;
            }
            if let Some(crf) = crf {
                config.encoder.crf = crf;
            }
            if debug_frames.is_some() {
                config.debug_frames_dir = debug_frames;
            }
            if let Some(every) = debug_every {
                config.debug_every = every;
            }

            info!(?input, ?output, ?config, "starting enhancement");
            let report = pipeline::remaster(&input, &output, &config).context("enhancement failed")?;
            print_summary(&report);
            Ok(())
        }
        cli::Command::Describe {
            input,
            output,
            tuning,
        } => {
            let mut config = load_config(tuning.config.as_deref())?;
            tuning.apply(&mut config);

            info!(?input, ?output, workers = config.workers, "starting description");
            let report = describe_to_file(&input, &output, &config)?;
            print_summary(&report);
            Ok(())
        }
        cli::Command::Probe { input } => {
            let info = decoder::probe(&input)
                .with_context(|| format!("failed to probe {}", input.display()))?;
            println!("width:       {}", info.width);
            println!("height:      {}", info.height);
            println!("fps:         {:.3}", info.fps);
            match info.frame_count {
                Some(count) => println!("frame count: {count}"),
                None => println!("frame count: unknown"),
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => Ok(PipelineConfig::load(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

/// Stream frame summaries to `output` as JSON lines.
fn describe_to_file(input: &Path, output: &Path, config: &PipelineConfig) -> Result<PipelineReport> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).context("failed to create output directory")?;
    }
    let file = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(file);

    let report = pipeline::describe(input, config, |summary| {
        serde_json::to_writer(&mut writer, summary).context("failed to encode frame summary")?;
        writer.write_all(b"\n").context("failed to write frame summary")?;
        Ok(())
    })
    .context("description failed")?;

    writer
        .flush()
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(?output, summaries = report.frames_written, "description written");
    Ok(report)
}

fn print_summary(report: &PipelineReport) {
    if !report.skipped.is_empty() {
        warn!(skipped = ?report.skipped, "some frames could not be processed");
    }
    println!(
        "{} frames read, {} processed, {} skipped, {} written ({} repeated, {} synthetic)",
        report.frames_read,
        report.processed,
        report.skipped.len(),
        report.frames_written,
        report.repeats,
        report.synthetic,
    );
}
