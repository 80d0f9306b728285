//! Frame-rate adaptation by repetition or linear interpolation.

use std::fmt;

use anyhow::{bail, Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::video::frame::Frame;

/// Absorbs float error in rate ratios such as 59.94 / 29.97.
const RATIO_EPSILON: f64 = 1e-9;

/// How extra output frames are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum AdaptMode {
    /// Emit each frame `factor` times.
    #[default]
    Repeat,
    /// Insert `factor - 1` blended frames between consecutive frames.
    Interpolate,
}

impl fmt::Display for AdaptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdaptMode::Repeat => write!(f, "repeat"),
            AdaptMode::Interpolate => write!(f, "interpolate"),
        }
    }
}

/// Derived from the source and target rates once per run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateConversionPlan {
    pub source_fps: f64,
    pub target_fps: f64,
    /// `target_fps / source_fps`.
    pub ratio: f64,
    /// `floor(ratio)`, at least 1.
    pub factor: u32,
}

impl RateConversionPlan {
    /// Rejects non-positive rates and targets below the source rate.
    pub fn new(source_fps: f64, target_fps: f64) -> Result<Self, PipelineError> {
        let invalid = |reason| PipelineError::InvalidRate {
            source_fps,
            target_fps,
            reason,
        };

        if !source_fps.is_finite() || source_fps <= 0.0 {
            return Err(invalid("source rate must be positive"));
        }
        if !target_fps.is_finite() || target_fps <= 0.0 {
            return Err(invalid("target rate must be positive"));
        }

        let ratio = target_fps / source_fps;
        let factor = (ratio + RATIO_EPSILON).floor();
        if factor < 1.0 {
            return Err(invalid("target rate below source rate is not supported"));
        }
        if factor > u32::MAX as f64 {
            return Err(invalid("rate ratio too large"));
        }

        Ok(Self {
            source_fps,
            target_fps,
            ratio,
            factor: factor as u32,
        })
    }

    /// Copies per frame in repeat mode.
    pub fn repeat_count(&self) -> u32 {
        self.factor
    }

    /// Synthetic frames between each consecutive pair in interpolate mode.
    pub fn interpolated_count(&self) -> u32 {
        self.factor - 1
    }

    pub fn is_passthrough(&self) -> bool {
        self.factor == 1
    }
}

/// Why a frame appears in the output stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameKind {
    /// The enhanced source frame itself.
    Original,
    /// Extra copy `n` (1-based) of the preceding original in repeat mode.
    Repeat(u32),
    /// Blend of the previous and current frames with weight `alpha` on the current.
    Synthetic { alpha: f32 },
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Original => write!(f, "original"),
            FrameKind::Repeat(n) => write!(f, "repeat {n}"),
            FrameKind::Synthetic { alpha } => write!(f, "synthetic a={alpha:.2}"),
        }
    }
}

/// One frame of the adapted stream, as handed to the emit callback.
pub struct OutputFrame<'a> {
    pub frame: &'a Frame,
    pub kind: FrameKind,
    /// Position in the output stream (0-based).
    pub index: u64,
    /// `index / target_fps`.
    pub timestamp_seconds: f64,
    /// Sequence number of the source frame this was derived from.
    pub source_seq: u64,
}

/// Counters over everything the adapter has emitted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdapterStats {
    pub originals: u64,
    pub repeats: u64,
    pub synthetic: u64,
}

impl AdapterStats {
    pub fn emitted(&self) -> u64 {
        self.originals + self.repeats + self.synthetic
    }
}

/// Turns the ordered enhanced stream into the ordered output stream.
pub struct FrameRateAdapter {
    plan: RateConversionPlan,
    mode: AdaptMode,
    prev: Option<Frame>,
    next_index: u64,
    stats: AdapterStats,
}

impl FrameRateAdapter {
    pub fn new(plan: RateConversionPlan, mode: AdaptMode) -> Self {
        info!(
            source_fps = plan.source_fps,
            target_fps = plan.target_fps,
            ratio = plan.ratio,
            factor = plan.factor,
            %mode,
            "frame rate adapter ready"
        );
        Self {
            plan,
            mode,
            prev: None,
            next_index: 0,
            stats: AdapterStats::default(),
        }
    }

    pub fn plan(&self) -> &RateConversionPlan {
        &self.plan
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    /// Feed the next frame in order; `emit` receives every resulting output frame in order.
    ///
    /// Errors from `emit` stop the call and are returned as is.
    pub fn push<F>(&mut self, seq: u64, frame: Frame, mut emit: F) -> Result<()>
    where
        F: FnMut(OutputFrame<'_>) -> Result<()>,
    {
        match self.mode {
            AdaptMode::Repeat => {
                self.emit(seq, &frame, FrameKind::Original, &mut emit)?;
                for copy in 1..self.plan.repeat_count() {
                    self.emit(seq, &frame, FrameKind::Repeat(copy), &mut emit)?;
                }
            }
            AdaptMode::Interpolate => {
                let k = self.plan.interpolated_count();
                if let Some(prev) = self.prev.take() {
                    let result = self.emit_blends(seq, &prev, &frame, k, &mut emit);
                    if result.is_err() {
                        self.prev = Some(prev);
                        return result;
                    }
                }
                self.emit(seq, &frame, FrameKind::Original, &mut emit)?;
                self.prev = Some(frame);
            }
        }
        Ok(())
    }

    fn emit_blends<F>(&mut self, seq: u64, prev: &Frame, curr: &Frame, k: u32, emit: &mut F) -> Result<()>
    where
        F: FnMut(OutputFrame<'_>) -> Result<()>,
    {
        for i in 1..=k {
            let alpha = i as f32 / (k + 1) as f32;
            let image = blend(&prev.image, &curr.image, alpha)?;
            let timestamp = prev.timestamp_seconds
                + (curr.timestamp_seconds - prev.timestamp_seconds) * alpha as f64;
            let synthetic = Frame::new(image, curr.frame_number, timestamp);
            self.emit(seq, &synthetic, FrameKind::Synthetic { alpha }, emit)?;
        }
        Ok(())
    }

    fn emit<F>(&mut self, seq: u64, frame: &Frame, kind: FrameKind, emit: &mut F) -> Result<()>
    where
        F: FnMut(OutputFrame<'_>) -> Result<()>,
    {
        let index = self.next_index;
        debug!(index, seq, %kind, "emitting output frame");
        emit(OutputFrame {
            frame,
            kind,
            index,
            timestamp_seconds: index as f64 / self.plan.target_fps,
            source_seq: seq,
        })?;

        self.next_index += 1;
        match kind {
            FrameKind::Original => self.stats.originals += 1,
            FrameKind::Repeat(_) => self.stats.repeats += 1,
            FrameKind::Synthetic { .. } => self.stats.synthetic += 1,
        }
        Ok(())
    }
}

/// Per-pixel `(1 - alpha) * prev + alpha * curr`, computed in `f32` and rounded.
pub fn blend(prev: &RgbImage, curr: &RgbImage, alpha: f32) -> Result<RgbImage> {
    if prev.dimensions() != curr.dimensions() {
        bail!(
            "cannot blend {}x{} with {}x{}",
            prev.width(),
            prev.height(),
            curr.width(),
            curr.height()
        );
    }

    let data: Vec<u8> = prev
        .as_raw()
        .iter()
        .zip(curr.as_raw())
        .map(|(&p, &c)| {
            let v = (1.0 - alpha) * p as f32 + alpha * c as f32;
            v.round().clamp(0.0, 255.0) as u8
        })
        .collect();

    let (width, height) = prev.dimensions();
    RgbImage::from_raw(width, height, data).context("blend output buffer has wrong length")
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn solid(n: u64, value: u8) -> Frame {
        Frame::new(RgbImage::from_pixel(2, 2, Rgb([value; 3])), n, n as f64 / 10.0)
    }

    /// Run `values` through an adapter, collecting (pixel value, kind, source seq).
    fn run(plan: RateConversionPlan, mode: AdaptMode, values: &[u8]) -> Vec<(u8, FrameKind, u64)> {
        let mut adapter = FrameRateAdapter::new(plan, mode);
        let mut out = Vec::new();
        for (seq, &v) in values.iter().enumerate() {
            adapter
                .push(seq as u64, solid(seq as u64, v), |o| {
                    out.push((o.frame.image.get_pixel(0, 0)[0], o.kind, o.source_seq));
                    Ok(())
                })
                .unwrap();
        }
        out
    }

    #[test]
    fn plan_uses_floor_of_ratio() {
        assert_eq!(RateConversionPlan::new(10.0, 30.0).unwrap().factor, 3);
        assert_eq!(RateConversionPlan::new(10.0, 25.0).unwrap().factor, 2);
        assert_eq!(RateConversionPlan::new(24.0, 24.0).unwrap().factor, 1);
        assert_eq!(RateConversionPlan::new(30000.0 / 1001.0, 60000.0 / 1001.0).unwrap().factor, 2);
    }

    #[test]
    fn plan_rejects_invalid_rates() {
        for (s, t) in [(0.0, 30.0), (30.0, 0.0), (-1.0, 30.0), (30.0, 24.0), (f64::NAN, 30.0)] {
            let err = RateConversionPlan::new(s, t).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidRate { .. }), "{s} -> {t}");
        }
    }

    #[test]
    fn repeat_mode_emits_each_frame_three_times_in_place() {
        let plan = RateConversionPlan::new(10.0, 30.0).unwrap();
        let out = run(plan, AdaptMode::Repeat, &[10, 20, 30]);
        let values: Vec<u8> = out.iter().map(|(v, _, _)| *v).collect();
        assert_eq!(values, vec![10, 10, 10, 20, 20, 20, 30, 30, 30]);
        assert_eq!(out[0].1, FrameKind::Original);
        assert_eq!(out[1].1, FrameKind::Repeat(1));
        assert_eq!(out[2].1, FrameKind::Repeat(2));
    }

    #[test]
    fn interpolate_mode_inserts_one_midpoint_per_pair() {
        let plan = RateConversionPlan::new(10.0, 25.0).unwrap();
        let out = run(plan, AdaptMode::Interpolate, &[0, 100, 200]);
        let values: Vec<u8> = out.iter().map(|(v, _, _)| *v).collect();
        assert_eq!(values, vec![0, 50, 100, 150, 200]);
        assert_eq!(out[0].1, FrameKind::Original, "no leading synthetic frame");
        assert_eq!(out[1].1, FrameKind::Synthetic { alpha: 0.5 });
        assert_eq!(out[1].2, 1, "synthetic frame belongs to the following source frame");
    }

    #[test]
    fn interpolate_mode_uses_increasing_alphas() {
        let plan = RateConversionPlan::new(10.0, 40.0).unwrap();
        let out = run(plan, AdaptMode::Interpolate, &[0, 200]);
        let values: Vec<u8> = out.iter().map(|(v, _, _)| *v).collect();
        assert_eq!(values, vec![0, 50, 100, 150, 200]);
        let alphas: Vec<f32> = out
            .iter()
            .filter_map(|(_, k, _)| match k {
                FrameKind::Synthetic { alpha } => Some(*alpha),
                _ => None,
            })
            .collect();
        assert_eq!(alphas, vec![0.25, 0.5, 0.75]);
    }

    #[test]
    fn equal_rates_pass_through_in_both_modes() {
        let plan = RateConversionPlan::new(24.0, 24.0).unwrap();
        assert!(plan.is_passthrough());
        for mode in [AdaptMode::Repeat, AdaptMode::Interpolate] {
            let out = run(plan, mode, &[1, 2, 3]);
            assert!(out.iter().all(|(_, k, _)| *k == FrameKind::Original));
            let values: Vec<u8> = out.iter().map(|(v, _, _)| *v).collect();
            assert_eq!(values, vec![1, 2, 3]);
        }
    }

    #[test]
    fn output_index_and_timestamps_follow_target_rate() {
        let plan = RateConversionPlan::new(10.0, 20.0).unwrap();
        let mut adapter = FrameRateAdapter::new(plan, AdaptMode::Repeat);
        let mut stamps = Vec::new();
        for seq in 0..2 {
            adapter
                .push(seq, solid(seq, 0), |o| {
                    stamps.push((o.index, o.timestamp_seconds));
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(stamps, vec![(0, 0.0), (1, 0.05), (2, 0.1), (3, 0.15)]);
        assert_eq!(adapter.stats(), AdapterStats { originals: 2, repeats: 2, synthetic: 0 });
    }

    #[test]
    fn blend_rounds_in_higher_precision() {
        let a = RgbImage::from_pixel(1, 1, Rgb([0, 1, 255]));
        let b = RgbImage::from_pixel(1, 1, Rgb([1, 2, 254]));
        let out = blend(&a, &b, 0.5).unwrap();
        // 0.5, 1.5 and 254.5 round away from zero.
        assert_eq!(out.get_pixel(0, 0), &Rgb([1, 2, 255]));
    }

    #[test]
    fn blend_rejects_mismatched_sizes() {
        let a = RgbImage::new(2, 2);
        let b = RgbImage::new(3, 2);
        assert!(blend(&a, &b, 0.5).is_err());
    }

    #[test]
    fn emit_error_stops_adapter() {
        let plan = RateConversionPlan::new(10.0, 30.0).unwrap();
        let mut adapter = FrameRateAdapter::new(plan, AdaptMode::Repeat);
        let mut calls = 0;
        let result = adapter.push(0, solid(0, 0), |_| {
            calls += 1;
            anyhow::bail!("disk full")
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert_eq!(adapter.stats().emitted(), 0);
    }
}
