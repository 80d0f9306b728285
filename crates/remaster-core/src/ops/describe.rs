//! Content description: `Frame -> FrameSummary`.

use anyhow::{bail, Result};
use serde::Serialize;

use super::FrameOperator;
use crate::video::frame::Frame;

/// Luma below this is reported as dark.
const DARK_LUMA: f64 = 0.25;
/// Luma above this is reported as bright.
const BRIGHT_LUMA: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Brightness {
    Dark,
    Normal,
    Bright,
}

/// Per-frame description emitted by a describe run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSummary {
    pub frame_number: u64,
    pub timestamp_seconds: f64,
    pub width: u32,
    pub height: u32,
    /// Mean of each channel, 0.0 to 1.0.
    pub mean_rgb: [f64; 3],
    /// Rec. 709 luma of the mean colour, 0.0 to 1.0.
    pub luma: f64,
    pub brightness: Brightness,
}

/// Summarizes colour and brightness of each frame.
pub struct Describe;

impl FrameOperator for Describe {
    type Output = FrameSummary;

    fn name(&self) -> &str {
        "describe"
    }

    fn apply(&self, frame: Frame) -> Result<FrameSummary> {
        let pixels = frame.width() as u64 * frame.height() as u64;
        if pixels == 0 {
            bail!("frame {} is empty", frame.frame_number);
        }

        let mut sums = [0u64; 3];
        for p in frame.image.pixels() {
            sums[0] += p[0] as u64;
            sums[1] += p[1] as u64;
            sums[2] += p[2] as u64;
        }
        let mean_rgb = sums.map(|s| s as f64 / pixels as f64 / 255.0);
        let luma = 0.2126 * mean_rgb[0] + 0.7152 * mean_rgb[1] + 0.0722 * mean_rgb[2];

        let brightness = if luma < DARK_LUMA {
            Brightness::Dark
        } else if luma > BRIGHT_LUMA {
            Brightness::Bright
        } else {
            Brightness::Normal
        };

        Ok(FrameSummary {
            frame_number: frame.frame_number,
            timestamp_seconds: frame.timestamp_seconds,
            width: frame.width(),
            height: frame.height(),
            mean_rgb,
            luma,
            brightness,
        })
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn black_frame_is_dark() {
        let frame = Frame::new(RgbImage::new(4, 4), 3, 0.1);
        let summary = Describe.apply(frame).unwrap();
        assert_eq!(summary.brightness, Brightness::Dark);
        assert_eq!(summary.luma, 0.0);
        assert_eq!(summary.frame_number, 3);
    }

    #[test]
    fn white_frame_is_bright() {
        let frame = Frame::new(RgbImage::from_pixel(2, 2, Rgb([255, 255, 255])), 0, 0.0);
        let summary = Describe.apply(frame).unwrap();
        assert_eq!(summary.brightness, Brightness::Bright);
        assert!((summary.luma - 1.0).abs() < 1e-9);
        assert_eq!(summary.mean_rgb, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn empty_frame_fails() {
        let frame = Frame::new(RgbImage::new(0, 0), 0, 0.0);
        assert!(Describe.apply(frame).is_err());
    }
}
