//! Run configuration, loadable from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::adapter::AdaptMode;
use crate::error::{ConfigError, PipelineError};
use crate::ops::enhance::{AspectRatio, ResampleFilter, SideFill};
use crate::video::encoder::EncoderSettings;

/// Frames buffered between the producer and the workers.
const DEFAULT_QUEUE_CAPACITY: usize = 8;
/// Completions the sequencer may hold ahead of the next expected frame.
const DEFAULT_REORDER_CAPACITY: usize = 16;
const DEFAULT_BACKPRESSURE_GRACE_MS: u64 = 2000;
const DEFAULT_DEBUG_EVERY: u64 = 30;

/// Parameters for the enhancement pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Output resolution multiplier (1 = unchanged).
    pub scale: u32,
    /// Output frame rate, or None to keep the source rate.
    pub target_fps: Option<f64>,
    /// How the output rate is reached.
    pub mode: AdaptMode,
    /// Number of enhancement worker threads.
    pub workers: usize,
    /// Capacity of the source-to-worker queue.
    pub queue_capacity: usize,
    /// Capacity of the reorder window.
    pub reorder_capacity: usize,
    /// How long a blocked producer waits before a backpressure warning.
    pub backpressure_grace_ms: u64,
    /// Median filter radius applied before upscaling (0 = off).
    pub denoise_radius: u32,
    /// Reframe to this aspect ratio before upscaling, e.g. "9:16".
    pub aspect: Option<AspectRatio>,
    /// How margins are filled when reframing to a wider picture.
    pub side_fill: SideFill,
    /// Resampling filter used for upscaling.
    pub filter: ResampleFilter,
    pub encoder: EncoderSettings,
    /// Directory to write annotated output frames, or None to skip.
    pub debug_frames_dir: Option<PathBuf>,
    /// Save every Nth output frame when `debug_frames_dir` is set.
    pub debug_every: u64,
    /// TrueType font for debug frame annotations.
    pub debug_font: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scale: 1,
            target_fps: None,
            mode: AdaptMode::Repeat,
            workers: num_cpus::get(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reorder_capacity: DEFAULT_REORDER_CAPACITY,
            backpressure_grace_ms: DEFAULT_BACKPRESSURE_GRACE_MS,
            denoise_radius: 0,
            aspect: None,
            side_fill: SideFill::default(),
            filter: ResampleFilter::default(),
            encoder: EncoderSettings::default(),
            debug_frames_dir: None,
            debug_every: DEFAULT_DEBUG_EVERY,
            debug_font: None,
        }
    }
}

impl PipelineConfig {
    /// Read a TOML file; keys left out keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(?path, "loaded pipeline config");
        Ok(config)
    }

    pub fn backpressure_grace(&self) -> Duration {
        Duration::from_millis(self.backpressure_grace_ms)
    }

    /// Check everything that does not depend on the source stream.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_string()));

        if self.scale == 0 {
            return invalid("scale must be >= 1");
        }
        if self.workers == 0 {
            return invalid("workers must be >= 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be >= 1");
        }
        if self.reorder_capacity == 0 {
            return invalid("reorder_capacity must be >= 1");
        }
        if self.debug_frames_dir.is_some() && self.debug_every == 0 {
            return invalid("debug_every must be >= 1");
        }
        if let Some(fps) = self.target_fps {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(PipelineError::InvalidRate {
                    source_fps: f64::NAN,
                    target_fps: fps,
                    reason: "target rate must be positive",
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.workers >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
scale = 2
target_fps = 60.0
mode = "interpolate"
filter = "catmull_rom"
aspect = "9:16"
side_fill = "extend"

[encoder]
crf = 23
"#
        )
        .unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.scale, 2);
        assert_eq!(config.target_fps, Some(60.0));
        assert_eq!(config.mode, AdaptMode::Interpolate);
        assert_eq!(config.filter, ResampleFilter::CatmullRom);
        assert_eq!(config.aspect, Some(AspectRatio::new(9, 16).unwrap()));
        assert_eq!(config.side_fill, SideFill::Extend);
        assert_eq!(config.encoder.crf, 23);
        assert_eq!(config.encoder.codec, "libx264");
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scale = \"two\"").unwrap();
        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn zero_aspect_term_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "aspect = \"9:0\"").unwrap();
        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = PipelineConfig::load(Path::new("/no/such/remaster.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn validate_rejects_zero_values() {
        let cases: [fn(&mut PipelineConfig); 4] = [
            |c| c.scale = 0,
            |c| c.workers = 0,
            |c| c.queue_capacity = 0,
            |c| c.reorder_capacity = 0,
        ];
        for mutate in cases {
            let mut config = PipelineConfig::default();
            mutate(&mut config);
            assert!(matches!(
                config.validate(),
                Err(PipelineError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn validate_rejects_non_positive_target_rate() {
        let config = PipelineConfig {
            target_fps: Some(0.0),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidRate { .. })
        ));
    }
}
