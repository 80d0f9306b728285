//! Built-in CPU enhancement operators.
//!
//! These stand in for model-backed operators: resampling for resolution
//! enhancement, a median filter for noise removal, and edge extension or a
//! blurred backdrop for filling the margins of a reframed picture.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use imageproc::filter::{gaussian_blur_f32, median_filter};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::FrameOperator;
use crate::video::frame::Frame;

/// Resampling filter used by [`Upscale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ResampleFilter {
    Nearest,
    Triangle,
    CatmullRom,
    Gaussian,
    #[default]
    Lanczos3,
}

impl From<ResampleFilter> for FilterType {
    fn from(f: ResampleFilter) -> Self {
        match f {
            ResampleFilter::Nearest => FilterType::Nearest,
            ResampleFilter::Triangle => FilterType::Triangle,
            ResampleFilter::CatmullRom => FilterType::CatmullRom,
            ResampleFilter::Gaussian => FilterType::Gaussian,
            ResampleFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// Passes frames through untouched.
pub struct Identity;

impl FrameOperator for Identity {
    type Output = Frame;

    fn name(&self) -> &str {
        "identity"
    }

    fn apply(&self, frame: Frame) -> Result<Frame> {
        Ok(frame)
    }
}

/// Enlarges each frame by an integer factor.
pub struct Upscale {
    scale: u32,
    filter: ResampleFilter,
}

impl Upscale {
    pub fn new(scale: u32, filter: ResampleFilter) -> Result<Self> {
        if scale == 0 {
            bail!("upscale factor must be >= 1");
        }
        Ok(Self { scale, filter })
    }
}

impl FrameOperator for Upscale {
    type Output = Frame;

    fn name(&self) -> &str {
        "upscale"
    }

    fn apply(&self, frame: Frame) -> Result<Frame> {
        if self.scale == 1 {
            return Ok(frame);
        }
        let width = frame.width() * self.scale;
        let height = frame.height() * self.scale;
        let image = imageops::resize(&frame.image, width, height, self.filter.into());
        debug!(frame_number = frame.frame_number, width, height, "upscaled frame");
        Ok(Frame { image, ..frame })
    }
}

/// Removes impulse noise with a square median filter.
pub struct Denoise {
    radius: u32,
}

impl Denoise {
    pub fn new(radius: u32) -> Self {
        Self { radius }
    }
}

impl FrameOperator for Denoise {
    type Output = Frame;

    fn name(&self) -> &str {
        "denoise"
    }

    fn apply(&self, frame: Frame) -> Result<Frame> {
        if self.radius == 0 {
            return Ok(frame);
        }
        let image = median_filter(&frame.image, self.radius, self.radius);
        Ok(Frame { image, ..frame })
    }
}

/// Width-to-height ratio of a picture, written as `W:H` (for example `9:16`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AspectRatio {
    width: u32,
    height: u32,
}

impl AspectRatio {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("aspect ratio terms must be >= 1, got {width}:{height}");
        }
        Ok(Self { width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

impl FromStr for AspectRatio {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (w, h) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("expected an aspect ratio like 9:16, got {s:?}"))?;
        let w = w.trim().parse().with_context(|| format!("invalid aspect width in {s:?}"))?;
        let h = h.trim().parse().with_context(|| format!("invalid aspect height in {s:?}"))?;
        Self::new(w, h)
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(aspect: AspectRatio) -> Self {
        aspect.to_string()
    }
}

/// How [`Reframe`] fills the margins when the target is wider than the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum SideFill {
    /// A stretched, heavily blurred copy of the frame behind it.
    #[default]
    Blur,
    /// Repeat the outermost column of each row.
    Extend,
}

/// Brings each frame to a target aspect ratio at its original height.
///
/// A narrower target keeps the centred region. A wider target centres the
/// frame and synthesizes the left and right margins.
pub struct Reframe {
    aspect: AspectRatio,
    fill: SideFill,
}

impl Reframe {
    pub fn new(aspect: AspectRatio, fill: SideFill) -> Self {
        Self { aspect, fill }
    }

    /// Output size for a `width` x `height` input. The width is rounded to an
    /// even number so yuv420p encoders accept it.
    pub fn output_size(&self, width: u32, height: u32) -> Result<(u32, u32)> {
        if width == 0 || height == 0 {
            bail!("cannot reframe an empty {width}x{height} frame");
        }
        let aw = self.aspect.width as u64;
        let ah = self.aspect.height as u64;
        let exact = (height as u64 * aw + ah / 2) / ah;
        let even = (exact & !1).max(2);
        let out_width = u32::try_from(even)
            .map_err(|_| anyhow!("reframed width {even} is too large"))?;
        Ok((out_width, height))
    }

    fn fill_margins(&self, source: &RgbImage, out_width: u32) -> RgbImage {
        let height = source.height();
        match self.fill {
            SideFill::Blur => {
                let stretched = imageops::resize(source, out_width, height, FilterType::Triangle);
                let sigma = (out_width.max(height) as f32 / 40.0).max(1.0);
                gaussian_blur_f32(&stretched, sigma)
            }
            SideFill::Extend => {
                let last = source.width() - 1;
                RgbImage::from_fn(out_width, height, |x, y| {
                    if x < out_width / 2 {
                        *source.get_pixel(0, y)
                    } else {
                        *source.get_pixel(last, y)
                    }
                })
            }
        }
    }
}

impl FrameOperator for Reframe {
    type Output = Frame;

    fn name(&self) -> &str {
        "reframe"
    }

    fn apply(&self, frame: Frame) -> Result<Frame> {
        let (width, height) = frame.image.dimensions();
        let (out_width, _) = self.output_size(width, height)?;
        if out_width == width {
            return Ok(frame);
        }

        let image = if out_width < width {
            let x = (width - out_width) / 2;
            imageops::crop_imm(&frame.image, x, 0, out_width, height).to_image()
        } else {
            let mut canvas = self.fill_margins(&frame.image, out_width);
            let x = (out_width - width) / 2;
            imageops::replace(&mut canvas, &frame.image, x as i64, 0);
            canvas
        };

        debug!(
            frame_number = frame.frame_number,
            from_width = width,
            to_width = out_width,
            aspect = %self.aspect,
            "reframed frame"
        );
        Ok(Frame { image, ..frame })
    }
}

/// Runs frame-to-frame operators one after another.
pub struct Chain {
    name: String,
    stages: Vec<Box<dyn FrameOperator<Output = Frame> + Sync>>,
}

impl Chain {
    pub fn new(stages: Vec<Box<dyn FrameOperator<Output = Frame> + Sync>>) -> Self {
        let name = if stages.is_empty() {
            "identity".to_string()
        } else {
            stages
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join("+")
        };
        Self { name, stages }
    }
}

impl FrameOperator for Chain {
    type Output = Frame;

    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, frame: Frame) -> Result<Frame> {
        self.stages.iter().try_fold(frame, |frame, stage| stage.apply(frame))
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn solid(width: u32, height: u32, value: u8) -> Frame {
        Frame::new(RgbImage::from_pixel(width, height, Rgb([value; 3])), 7, 0.25)
    }

    #[test]
    fn upscale_multiplies_dimensions_and_keeps_metadata() {
        let op = Upscale::new(2, ResampleFilter::Nearest).unwrap();
        let out = op.apply(solid(16, 9, 100)).unwrap();
        assert_eq!((out.width(), out.height()), (32, 18));
        assert_eq!(out.frame_number, 7);
        assert_eq!(out.timestamp_seconds, 0.25);
        assert_eq!(out.image.get_pixel(31, 17), &Rgb([100, 100, 100]));
    }

    #[test]
    fn upscale_rejects_zero_factor() {
        assert!(Upscale::new(0, ResampleFilter::Lanczos3).is_err());
    }

    #[test]
    fn denoise_removes_single_pixel_impulse() {
        let mut frame = solid(9, 9, 50);
        frame.image.put_pixel(4, 4, Rgb([255, 255, 255]));
        let out = Denoise::new(1).apply(frame).unwrap();
        assert_eq!(out.image.get_pixel(4, 4), &Rgb([50, 50, 50]));
    }

    #[test]
    fn chain_applies_stages_in_order_and_names_them() {
        let chain = Chain::new(vec![
            Box::new(Denoise::new(1)),
            Box::new(Upscale::new(3, ResampleFilter::Triangle).unwrap()),
        ]);
        assert_eq!(chain.name(), "denoise+upscale");
        let out = chain.apply(solid(4, 4, 10)).unwrap();
        assert_eq!((out.width(), out.height()), (12, 12));
    }

    #[test]
    fn empty_chain_is_identity() {
        let chain = Chain::new(Vec::new());
        assert_eq!(chain.name(), "identity");
        let out = chain.apply(solid(2, 2, 1)).unwrap();
        assert_eq!((out.width(), out.height()), (2, 2));
    }

    #[test]
    fn aspect_ratio_parses_and_round_trips_through_toml_strings() {
        let aspect: AspectRatio = "9:16".parse().unwrap();
        assert_eq!((aspect.width(), aspect.height()), (9, 16));
        assert_eq!(String::from(aspect), "9:16");
        assert!("9x16".parse::<AspectRatio>().is_err());
        assert!("0:16".parse::<AspectRatio>().is_err());
        assert!("9:".parse::<AspectRatio>().is_err());
    }

    #[test]
    fn reframe_output_size_keeps_height_and_even_width() {
        let vertical = Reframe::new("9:16".parse().unwrap(), SideFill::Blur);
        assert_eq!(vertical.output_size(1920, 1080).unwrap(), (608, 1080));
        let wide = Reframe::new("16:9".parse().unwrap(), SideFill::Blur);
        assert_eq!(wide.output_size(640, 480).unwrap(), (852, 480));
        assert!(wide.output_size(0, 480).is_err());
    }

    #[test]
    fn reframe_to_narrower_aspect_crops_the_centre() {
        // 32x18 is 16:9; columns are numbered so the crop offset is visible.
        let image = RgbImage::from_fn(32, 18, |x, _| Rgb([x as u8, 0, 0]));
        let frame = Frame::new(image, 3, 0.1);
        let op = Reframe::new("9:16".parse().unwrap(), SideFill::Blur);

        let out = op.apply(frame).unwrap();
        assert_eq!((out.width(), out.height()), (10, 18));
        assert_eq!(out.image.get_pixel(0, 0)[0], 11);
        assert_eq!(out.image.get_pixel(9, 17)[0], 20);
        assert_eq!(out.frame_number, 3);
    }

    #[test]
    fn reframe_to_wider_aspect_extends_edges() {
        let mut image = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        for y in 0..4 {
            image.put_pixel(0, y, Rgb([10, 10, 10]));
            image.put_pixel(3, y, Rgb([200, 200, 200]));
        }
        let op = Reframe::new("2:1".parse().unwrap(), SideFill::Extend);

        let out = op.apply(Frame::new(image.clone(), 0, 0.0)).unwrap();
        assert_eq!((out.width(), out.height()), (8, 4));
        for y in 0..4 {
            assert_eq!(out.image.get_pixel(0, y), &Rgb([10, 10, 10]));
            assert_eq!(out.image.get_pixel(1, y), &Rgb([10, 10, 10]));
            assert_eq!(out.image.get_pixel(6, y), &Rgb([200, 200, 200]));
            assert_eq!(out.image.get_pixel(7, y), &Rgb([200, 200, 200]));
            for x in 0..4 {
                assert_eq!(out.image.get_pixel(x + 2, y), image.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn reframe_blur_fill_keeps_original_pixels_in_the_middle() {
        let image = RgbImage::from_fn(6, 6, |x, y| Rgb([(x * 40) as u8, (y * 40) as u8, 7]));
        let op = Reframe::new("16:9".parse().unwrap(), SideFill::Blur);

        let out = op.apply(Frame::new(image.clone(), 0, 0.0)).unwrap();
        assert_eq!((out.width(), out.height()), (10, 6));
        for y in 0..6 {
            for x in 0..6 {
                assert_eq!(out.image.get_pixel(x + 2, y), image.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn reframe_to_same_aspect_is_a_no_op() {
        let op = Reframe::new("1:1".parse().unwrap(), SideFill::Extend);
        let out = op.apply(solid(6, 6, 42)).unwrap();
        assert_eq!((out.width(), out.height()), (6, 6));
        assert_eq!(out.image.get_pixel(5, 5), &Rgb([42, 42, 42]));
    }
}
