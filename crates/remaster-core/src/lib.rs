//! Concurrent frame-by-frame video enhancement with frame-rate adaptation.

pub mod adapter;
pub mod config;
pub mod debug;
pub mod error;
pub mod ops;
pub mod pipeline;
pub mod queue;
pub mod sequencer;
pub mod video;
pub mod workers;

pub use config::PipelineConfig;
pub use error::{ConfigError, PipelineError};
pub use pipeline::{describe, remaster, run_describe, run_pipeline, PipelineReport, PipelineState};
