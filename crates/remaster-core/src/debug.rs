use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::{debug, info, warn};

use crate::adapter::{FrameKind, OutputFrame};

/// Tried in order when no font is configured.
const FALLBACK_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
    "/System/Library/Fonts/Menlo.ttc",
    "C:\\Windows\\Fonts\\consola.ttf",
];

const TEXT_SCALE: f32 = 28.0;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const TEXT_LINE_HEIGHT: i32 = 30;

const ORIGINAL_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const REPEAT_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const SYNTHETIC_COLOR: Rgb<u8> = Rgb([255, 0, 255]);

/// Saves every Nth output frame as a PNG annotated with where it came from.
pub struct DebugRenderer {
    dir: PathBuf,
    every: u64,
    font: Option<FontVec>,
}

impl DebugRenderer {
    pub fn new(dir: &Path, every: u64, font_path: Option<&Path>) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create debug frames directory {}", dir.display()))?;
        info!(?dir, every, "debug frames directory ready");

        let font = match font_path {
            Some(path) => Self::load_font(path),
            None => FALLBACK_FONTS
                .iter()
                .map(Path::new)
                .filter(|p| p.exists())
                .find_map(Self::load_font),
        };
        if font.is_none() {
            warn!("no debug font available, frames will be saved without text");
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            every: every.max(1),
            font,
        })
    }

    /// Save `out` if its index falls on the sampling interval.
    pub fn observe(&self, out: &OutputFrame<'_>) -> Result<()> {
        if out.index % self.every != 0 {
            return Ok(());
        }
        self.save_frame(out).map(|_| ())
    }

    pub fn save_frame(&self, out: &OutputFrame<'_>) -> Result<PathBuf> {
        let mut img = out.frame.image.clone();

        if img.width() > 0 && img.height() > 0 {
            let border = Rect::at(0, 0).of_size(img.width(), img.height());
            draw_hollow_rect_mut(&mut img, border, kind_color(out.kind));
        }
        self.draw_text_overlay(&mut img, out);

        let path = self.dir.join(format!("frame_{:08}.png", out.index));
        img.save(&path)
            .with_context(|| format!("failed to save debug frame to {}", path.display()))?;

        debug!(?path, index = out.index, "saved debug frame");
        Ok(path)
    }

    fn draw_text_overlay(&self, img: &mut RgbImage, out: &OutputFrame<'_>) {
        let Some(font) = &self.font else { return };
        let scale = PxScale::from(TEXT_SCALE);
        let x = 10;
        let mut y = 10;

        for line in overlay_lines(out) {
            draw_text_mut(img, TEXT_COLOR, x, y, scale, font, &line);
            y += TEXT_LINE_HEIGHT;
        }
    }

    fn load_font(path: &Path) -> Option<FontVec> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                warn!(?path, error = %e, "failed to read font file");
                return None;
            }
        };
        match FontVec::try_from_vec(data) {
            Ok(font) => {
                info!(?path, "loaded debug font");
                Some(font)
            }
            Err(e) => {
                warn!(?path, error = %e, "failed to parse font file");
                None
            }
        }
    }
}

fn overlay_lines(out: &OutputFrame<'_>) -> [String; 3] {
    [
        format!("OUT:{} T:{:.3}", out.index, out.timestamp_seconds),
        format!("SRC:{} F:{}", out.source_seq, out.frame.frame_number),
        out.kind.to_string().to_uppercase(),
    ]
}

fn kind_color(kind: FrameKind) -> Rgb<u8> {
    match kind {
        FrameKind::Original => ORIGINAL_COLOR,
        FrameKind::Repeat(_) => REPEAT_COLOR,
        FrameKind::Synthetic { .. } => SYNTHETIC_COLOR,
    }
}
