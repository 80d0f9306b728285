//! Fatal error types for the remaster pipeline.
//!
//! Per-frame operator failures are not errors at this level: they are counted
//! and skipped (see [`crate::workers::FrameFailure`]).

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that abort a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid frame rates: source {source_fps} fps, target {target_fps} fps ({reason})")]
    InvalidRate {
        source_fps: f64,
        target_fps: f64,
        reason: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to open source {path}")]
    SourceOpen {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to open sink {path}")]
    SinkOpen {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to build frame operator")]
    OperatorInit(#[source] anyhow::Error),

    #[error("failed to read frame from source")]
    SourceRead(#[source] anyhow::Error),

    #[error("frame consumer failed at sequence {seq}")]
    Consumer {
        seq: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to close sink")]
    SinkClose(#[source] anyhow::Error),

    #[error("failed to spawn pipeline thread")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("pipeline thread panicked: {0}")]
    ThreadPanic(String),
}

impl PipelineError {
    /// Whether this error was raised before any thread was started.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidRate { .. }
                | PipelineError::InvalidConfig(_)
                | PipelineError::SourceOpen { .. }
                | PipelineError::SinkOpen { .. }
                | PipelineError::OperatorInit(_)
        )
    }
}

/// Errors loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
