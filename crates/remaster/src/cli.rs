use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use remaster_core::adapter::AdaptMode;
use remaster_core::ops::enhance::{AspectRatio, ResampleFilter, SideFill};
use remaster_core::PipelineConfig;

#[derive(Parser)]
#[command(name = "remaster", about = "Concurrent video enhancement and frame-rate conversion")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Enhance a video and re-encode it, optionally at a higher frame rate.
    Enhance {
        /// Path to the input video file.
        #[arg(short, long)]
        input: PathBuf,

        /// Path to write the output video.
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        tuning: Tuning,

        /// Resolution multiplier.
        #[arg(long)]
        scale: Option<u32>,

        /// Output frame rate (default: the source rate).
        #[arg(long)]
        fps: Option<f64>,

        /// How extra frames are produced when the output rate is higher.
        #[arg(long, value_enum)]
        mode: Option<AdaptMode>,

        /// Median filter radius applied before upscaling (0 disables).
        #[arg(long)]
        denoise: Option<u32>,

        /// Reframe to this aspect ratio before upscaling, e.g. 9:16.
        #[arg(long)]
        aspect: Option<AspectRatio>,

        /// How margins are filled when reframing to a wider picture.
        #[arg(long, value_enum)]
        side_fill: Option<SideFill>,

        /// Resampling filter for upscaling.
        #[arg(long, value_enum)]
        filter: Option<ResampleFilter>,

        /// Encoder constant rate factor.
        #[arg(long)]
        crf: Option<u8>,

        /// Directory to save annotated output frames.
        #[arg(long)]
        debug_frames: Option<PathBuf>,

        /// Save every Nth output frame when --debug-frames is set.
        #[arg(long)]
        debug_every: Option<u64>,
    },

    /// Write a JSON summary line for every frame of a video.
    Describe {
        /// Path to the input video file.
        #[arg(short, long)]
        input: PathBuf,

        /// Path to write JSON lines to.
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// Print stream metadata of a video.
    Probe {
        /// Path to the input video file.
        #[arg(short, long)]
        input: PathBuf,
    },
}

/// Options shared by every pipeline run.
#[derive(Args)]
pub struct Tuning {
    /// TOML file with pipeline settings; flags override it.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of worker threads (default: logical CPUs).
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Capacity of the source-to-worker queue.
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Completions held for reordering ahead of the next frame.
    #[arg(long)]
    pub reorder_capacity: Option<usize>,
}

impl Tuning {
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(capacity) = self.reorder_capacity {
            config.reorder_capacity = capacity;
        }
    }
}
